//! Payload lifecycle helpers.
//!
//! Payloads move between worker threads and outputs by value; duplication is
//! `Clone` and release is `Drop`. What remains here is construction,
//! container-size accounting, and tag stamping.

use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;

use crate::container::NmsgPayload;

impl NmsgPayload {
    /// Build a payload around a copy of `bytes`.
    pub fn make(bytes: &[u8], vid: u32, msgtype: u32, time_sec: u64, time_nsec: u32) -> Self {
        Self {
            vid,
            msgtype,
            time_sec,
            time_nsec,
            payload: Some(bytes.to_vec()),
            source: None,
            operator: None,
            group: None,
        }
    }

    /// Bytes of payload data carried, zero when absent.
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, |p| p.len())
    }

    /// The packed size this payload contributes to a container, including
    /// the field tag and the varint-encoded length prefix (one extra byte
    /// per 7 bits beyond the first).
    pub fn packed_size(&self) -> usize {
        let len = self.encoded_len();
        let mut prefix = 1;
        let mut v = len >> 7;
        while v != 0 {
            prefix += 1;
            v >>= 7;
        }
        1 + prefix + len
    }

    /// Apply source/operator/group tags. `None` leaves a field untouched, so
    /// narrower settings can layer over wider ones.
    pub fn stamp(&mut self, source: Option<u32>, operator: Option<u32>, group: Option<u32>) {
        if source.is_some() {
            self.source = source;
        }
        if operator.is_some() {
            self.operator = operator;
        }
        if group.is_some() {
            self.group = group;
        }
    }
}

/// Wall-clock (seconds, nanoseconds) since the epoch.
pub fn now_timespec() -> (u64, u32) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_copies_bytes() {
        let src = vec![1u8, 2, 3];
        let np = NmsgPayload::make(&src, 1, 2, 100, 5);
        assert_eq!(np.payload.as_deref(), Some(&src[..]));
        assert_eq!(np.payload_len(), 3);
        assert_eq!((np.vid, np.msgtype, np.time_sec, np.time_nsec), (1, 2, 100, 5));
    }

    #[test]
    fn test_packed_size_tracks_encoding() {
        let np = NmsgPayload::make(&[0u8; 16], 1, 1, 1, 1);
        // tag + single-byte length prefix + message bytes
        assert_eq!(np.packed_size(), 2 + np.encoded_len());

        // a payload large enough to need a two-byte varint prefix
        let big = NmsgPayload::make(&vec![0u8; 300], 1, 1, 1, 1);
        assert_eq!(big.packed_size(), 3 + big.encoded_len());
        assert!(big.encoded_len() > 127);
    }

    #[test]
    fn test_stamp_layers() {
        let mut np = NmsgPayload::make(b"x", 1, 1, 0, 0);
        np.stamp(Some(7), None, Some(9));
        np.stamp(None, Some(8), None);
        assert_eq!((np.source, np.operator, np.group), (Some(7), Some(8), Some(9)));
    }

    #[test]
    fn test_clone_is_deep() {
        let np = NmsgPayload::make(b"abc", 1, 1, 0, 0);
        let mut dup = np.clone();
        dup.payload.as_mut().unwrap()[0] = b'z';
        assert_eq!(np.payload.as_deref(), Some(&b"abc"[..]));
    }
}

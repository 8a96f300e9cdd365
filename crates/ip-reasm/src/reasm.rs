//! Fragmented IPv4/IPv6 datagram reassembly.
//!
//! Fragments are grouped by flow identity into entries held in a slab arena.
//! Each entry keeps its fragments in a sorted list headed by a zero-length
//! sentinel and tracks the number of holes remaining; `holes == 0` means the
//! datagram is complete. Entries are linked into two index-based lists: a
//! per-bucket hash chain for lookup and a global time-ordered list for
//! expiry. The time list is in deadline order because the timeout is
//! constant and entries are created in arrival order, so expiry only ever
//! pops the head.
//!
//! Overlapping or otherwise unacceptable fragments poison the entry: it
//! transitions to `Invalid` and every later fragment of the same flow is
//! counted and dropped until the entry times out.

use crate::frame::IpVersion;

const HASH_BUCKETS: usize = 1021; // prime

const IP_MF: u16 = 0x2000;
const IP_OFFMASK: u16 = 0x1fff;

// IPv6 fragment header: offset field is the upper 13 bits in 8-octet units,
// so masking without shifting yields the offset in bytes.
const IP6F_OFF_MASK: u16 = 0xfff8;
const IP6F_MORE_FRAG: u16 = 0x0001;

const IPPROTO_HOPOPTS: u8 = 0;
const IPPROTO_ROUTING: u8 = 43;
const IPPROTO_FRAGMENT: u8 = 44;
const IPPROTO_DSTOPTS: u8 = 60;

/// Packet reception time, seconds + nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PktTime {
    pub sec: u64,
    pub nsec: u32,
}

impl PktTime {
    pub fn new(sec: u64, nsec: u32) -> Self {
        Self { sec, nsec }
    }
}

/// Flow identity: the key grouping fragments into one in-flight datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKey {
    V4 {
        src: [u8; 4],
        dst: [u8; 4],
        id: u16,
        proto: u8,
    },
    V6 {
        src: [u8; 16],
        dst: [u8; 16],
        id: u32,
    },
}

impl FlowKey {
    /// Multiplicative byte mix; reduced modulo the bucket count by the caller.
    fn mix(&self) -> u32 {
        match self {
            FlowKey::V4 { src, dst, id, proto } => {
                let mut hash: u32 = 0;
                for i in 0..4 {
                    hash = hash.wrapping_mul(37).wrapping_add(src[i] as u32);
                    hash = hash.wrapping_mul(37).wrapping_add(dst[i] as u32);
                }
                hash = hash.wrapping_mul(59).wrapping_add(*id as u32);
                hash.wrapping_mul(47).wrapping_add(*proto as u32)
            }
            FlowKey::V6 { src, dst, id } => {
                let mut hash: u32 = 0;
                for i in 0..16 {
                    hash = hash.wrapping_mul(37).wrapping_add(src[i] as u32);
                    hash = hash.wrapping_mul(37).wrapping_add(dst[i] as u32);
                }
                hash.wrapping_mul(59).wrapping_add(*id)
            }
        }
    }

    fn version(&self) -> IpVersion {
        match self {
            FlowKey::V4 { .. } => IpVersion::V4,
            FlowKey::V6 { .. } => IpVersion::V6,
        }
    }
}

/// One received piece of a datagram. `data` holds the full received packet;
/// `data_offset` is where its payload begins, and for the lowest-offset
/// fragment it also measures the header bytes reused as the reconstructed
/// datagram's unfragmentable header.
#[derive(Debug, Clone)]
struct Fragment {
    offset: usize,
    len: usize,
    data_offset: usize,
    data: Vec<u8>,
    /// IPv6: byte offset where the Fragment header's predecessor stored its
    /// Next-Header value.
    last_nxt: usize,
    /// IPv6: upper-layer protocol carried in the Fragment header.
    ip6f_nxt: u8,
    ts: PktTime,
}

impl Fragment {
    fn sentinel() -> Self {
        Self {
            offset: 0,
            len: 0,
            data_offset: 0,
            data: Vec::new(),
            last_nxt: 0,
            ip6f_nxt: 0,
            ts: PktTime::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Active,
    Invalid,
}

struct Entry {
    key: FlowKey,
    /// Sorted by ascending offset; index 0 is the sentinel.
    frags: Vec<Fragment>,
    /// Total payload length, known once the terminal fragment arrives.
    len: usize,
    holes: u32,
    frag_count: u32,
    state: EntryState,
    deadline_sec: u64,
    bucket: usize,
    hash_prev: Option<usize>,
    hash_next: Option<usize>,
    time_prev: Option<usize>,
    time_next: Option<usize>,
}

/// A completed datagram's fragments, detached from the reassembler.
pub struct FragmentSet {
    version: IpVersion,
    len: usize,
    /// Sorted by offset; the sentinel has been dropped.
    frags: Vec<Fragment>,
}

impl FragmentSet {
    pub fn ip_version(&self) -> IpVersion {
        self.version
    }

    /// Reassembled payload length (headers excluded).
    pub fn payload_len(&self) -> usize {
        self.len
    }

    pub fn fragment_count(&self) -> usize {
        self.frags.len()
    }

    /// Reception time of the lowest-offset fragment.
    pub fn timestamp(&self) -> PktTime {
        self.frags[0].ts
    }

    /// Rebuild the contiguous datagram.
    ///
    /// The lowest-offset fragment supplies the unfragmentable header. IPv4
    /// gets its offset field zeroed, total length rewritten, and header
    /// checksum recomputed; IPv6 drops the Fragment extension header,
    /// restores the upper-layer protocol at the predecessor's Next-Header
    /// byte, and rewrites the payload length.
    pub fn assemble(&self) -> Vec<u8> {
        let first = &self.frags[0];
        let header_len = match self.version {
            IpVersion::V4 => first.data_offset,
            IpVersion::V6 => first.data_offset - 8,
        };

        let mut out = vec![0u8; header_len + self.len];
        out[..header_len].copy_from_slice(&first.data[..header_len]);
        if self.version == IpVersion::V6 {
            out[first.last_nxt] = first.ip6f_nxt;
        }

        for frag in &self.frags {
            let dst = header_len + frag.offset;
            out[dst..dst + frag.len]
                .copy_from_slice(&frag.data[frag.data_offset..frag.data_offset + frag.len]);
        }

        match self.version {
            IpVersion::V4 => {
                let total = (header_len + self.len) as u16;
                out[2..4].copy_from_slice(&total.to_be_bytes());
                out[6..8].copy_from_slice(&[0, 0]);
                out[10..12].copy_from_slice(&[0, 0]);

                let mut sum: u32 = 0;
                let mut i = 0;
                while i < header_len {
                    let word = (out[i] as u32) << 8 | out[i + 1] as u32;
                    sum += word;
                    if sum & 0x8000_0000 != 0 {
                        sum = (sum & 0xffff) + (sum >> 16);
                    }
                    i += 2;
                }
                while sum >> 16 != 0 {
                    sum = (sum & 0xffff) + (sum >> 16);
                }
                out[10..12].copy_from_slice(&(!(sum as u16)).to_be_bytes());
            }
            IpVersion::V6 => {
                let plen = (header_len + self.len - 40) as u16;
                out[4..6].copy_from_slice(&plen.to_be_bytes());
            }
        }

        out
    }
}

/// Outcome of submitting one packet to the reassembler.
pub enum SubmitOutcome {
    /// Not a recognizable IP fragment; the packet was not consumed.
    NotFragment,
    /// Fragment stored (or counted and dropped); the datagram is not yet
    /// complete.
    Accepted,
    /// The final hole was filled; the caller now owns the fragments.
    Complete(FragmentSet),
}

/// Bounded, time-expiring fragment cache for IPv4 and IPv6 datagrams.
///
/// Single-threaded by contract: one capture thread feeds one engine, with
/// packets submitted in chronological order.
pub struct IpReassembler {
    buckets: Vec<Option<usize>>,
    time_head: Option<usize>,
    time_tail: Option<usize>,
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    timeout_sec: u64,
    waiting: u32,
    max_waiting: u32,
    timed_out: u32,
    dropped_frags: u32,
}

impl IpReassembler {
    pub fn new(timeout_sec: u64) -> Self {
        Self {
            buckets: vec![None; HASH_BUCKETS],
            time_head: None,
            time_tail: None,
            slots: Vec::new(),
            free: Vec::new(),
            timeout_sec,
            waiting: 0,
            max_waiting: 0,
            timed_out: 0,
            dropped_frags: 0,
        }
    }

    /// Change the fragment timeout. Fails while any entry is in flight: the
    /// time-ordered list is only sorted under a constant timeout.
    pub fn set_timeout(&mut self, timeout_sec: u64) -> bool {
        if self.time_head.is_some() {
            return false;
        }
        self.timeout_sec = timeout_sec;
        true
    }

    /// Entries currently awaiting completion.
    pub fn waiting(&self) -> u32 {
        self.waiting
    }

    /// High-water mark of `waiting`.
    pub fn max_waiting(&self) -> u32 {
        self.max_waiting
    }

    /// Entries expired without completing.
    pub fn timed_out(&self) -> u32 {
        self.timed_out
    }

    /// Fragments dropped (duplicates, overlaps, and fragments arriving for
    /// poisoned entries).
    pub fn dropped_frags(&self) -> u32 {
        self.dropped_frags
    }

    /// Submit one network-layer packet (starting at the IP header).
    ///
    /// Expiry runs first: entries whose deadline precedes `now` are removed
    /// from the head of the time list and counted in `timed_out`.
    pub fn submit(&mut self, packet: &[u8], now: PktTime) -> SubmitOutcome {
        self.expire(now);

        let (key, frag, last_frag) = match parse_fragment(packet, now) {
            Some(parsed) => parsed,
            None => return SubmitOutcome::NotFragment,
        };

        let bucket = (key.mix() as usize) % HASH_BUCKETS;
        let mut found = None;
        let mut cursor = self.buckets[bucket];
        while let Some(idx) = cursor {
            let entry = self.entry(idx);
            if entry.key == key {
                found = Some(idx);
                break;
            }
            cursor = entry.hash_next;
        }

        let idx = match found {
            Some(idx) => idx,
            None => self.insert_entry(key, bucket, now),
        };

        if self.entry(idx).state != EntryState::Active {
            self.dropped_frags += 1;
            return SubmitOutcome::Accepted;
        }

        let entry = self.entry_mut(idx);
        if !add_fragment(entry, frag, last_frag) {
            entry.state = EntryState::Invalid;
            let dropped = entry.frag_count + 1;
            self.dropped_frags += dropped;
            return SubmitOutcome::Accepted;
        }

        if self.entry(idx).holes != 0 {
            return SubmitOutcome::Accepted;
        }

        let entry = self.detach(idx);
        let mut frags = entry.frags;
        frags.remove(0); // sentinel
        SubmitOutcome::Complete(FragmentSet {
            version: entry.key.version(),
            len: entry.len,
            frags,
        })
    }

    fn entry(&self, idx: usize) -> &Entry {
        self.slots[idx].as_ref().expect("live slab index")
    }

    fn entry_mut(&mut self, idx: usize) -> &mut Entry {
        self.slots[idx].as_mut().expect("live slab index")
    }

    fn insert_entry(&mut self, key: FlowKey, bucket: usize, now: PktTime) -> usize {
        let entry = Entry {
            key,
            frags: vec![Fragment::sentinel()],
            len: 0,
            holes: 1,
            frag_count: 0,
            state: EntryState::Active,
            deadline_sec: now.sec + self.timeout_sec,
            bucket,
            hash_prev: None,
            hash_next: self.buckets[bucket],
            time_prev: self.time_tail,
            time_next: None,
        };

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };

        if let Some(next) = self.entry(idx).hash_next {
            self.entry_mut(next).hash_prev = Some(idx);
        }
        self.buckets[bucket] = Some(idx);

        match self.time_tail {
            Some(tail) => self.entry_mut(tail).time_next = Some(idx),
            None => self.time_head = Some(idx),
        }
        self.time_tail = Some(idx);

        self.waiting += 1;
        if self.waiting > self.max_waiting {
            self.max_waiting = self.waiting;
        }

        idx
    }

    /// Unlink an entry from both lists and return it, recycling the slot.
    fn detach(&mut self, idx: usize) -> Entry {
        let (bucket, hash_prev, hash_next, time_prev, time_next) = {
            let e = self.entry(idx);
            (e.bucket, e.hash_prev, e.hash_next, e.time_prev, e.time_next)
        };

        match hash_prev {
            Some(prev) => self.entry_mut(prev).hash_next = hash_next,
            None => self.buckets[bucket] = hash_next,
        }
        if let Some(next) = hash_next {
            self.entry_mut(next).hash_prev = hash_prev;
        }

        match time_prev {
            Some(prev) => self.entry_mut(prev).time_next = time_next,
            None => self.time_head = time_next,
        }
        match time_next {
            Some(next) => self.entry_mut(next).time_prev = time_prev,
            None => self.time_tail = time_prev,
        }

        self.waiting -= 1;
        self.free.push(idx);
        self.slots[idx].take().expect("live slab index")
    }

    fn expire(&mut self, now: PktTime) {
        while let Some(head) = self.time_head {
            if self.entry(head).deadline_sec >= now.sec {
                break;
            }
            let entry = self.detach(head);
            self.timed_out += 1;
            tracing::trace!(
                deadline = entry.deadline_sec,
                frags = entry.frag_count,
                "fragment entry expired"
            );
        }
    }
}

/// Insert a fragment into an entry's sorted list, maintaining the hole
/// count. Returns false if the fragment is unacceptable (the caller poisons
/// the entry).
///
/// Hole accounting on insertion:
/// - the fragment fills a hole completely: holes decrease by one
/// - the fragment splits a hole: holes increase by one
/// - the fragment attaches to one end of a hole: holes unchanged
fn add_fragment(entry: &mut Entry, frag: Fragment, last_frag: bool) -> bool {
    // A non-terminal fragment whose payload is not a multiple of 8 can never
    // be abutted by its successor.
    if !last_frag && frag.len % 8 != 0 {
        return false;
    }

    if entry.len != 0 && frag.offset + frag.len > entry.len {
        // extends past the known end
        return false;
    }

    let mut fit_left = false;
    let mut fit_right = false;

    if last_frag {
        if entry.len != 0 {
            // duplicate terminal fragment
            return false;
        }
        entry.len = frag.offset + frag.len;
        fit_right = true;
    }

    let mut cur = 0;
    while cur + 1 < entry.frags.len() && entry.frags[cur + 1].offset <= frag.offset {
        cur += 1;
    }
    // Fragment is to be inserted between `cur` and `cur + 1` (if any).

    let left = &entry.frags[cur];
    if left.offset + left.len > frag.offset {
        return false; // overlaps left neighbor
    } else if left.offset + left.len == frag.offset {
        fit_left = true;
    }

    if let Some(right) = entry.frags.get(cur + 1) {
        if last_frag {
            // a later fragment already extends past this "terminal" one
            return false;
        }
        if frag.offset + frag.len > right.offset {
            return false; // overlaps right neighbor
        } else if frag.offset + frag.len == right.offset {
            fit_right = true;
        }
    }

    if frag.len != 0 {
        entry.frags.insert(cur + 1, frag);
        if fit_left && fit_right {
            entry.holes -= 1;
        } else if !fit_left && !fit_right {
            entry.holes += 1;
        }
        entry.frag_count += 1;
    } else if last_frag && fit_left {
        // A zero-length terminal fragment is not stored, but if it abuts the
        // fragment to its left exactly, it still closes that hole.
        entry.holes -= 1;
    }

    true
}

fn be16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn be32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Parse a network-layer packet into a fragment, or None if it is not a
/// recognizable fragment of a fragmented datagram.
fn parse_fragment(packet: &[u8], ts: PktTime) -> Option<(FlowKey, Fragment, bool)> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 => parse_fragment_v4(packet, ts),
        6 => parse_fragment_v6(packet, ts),
        _ => None,
    }
}

fn parse_fragment_v4(packet: &[u8], ts: PktTime) -> Option<(FlowKey, Fragment, bool)> {
    if packet.len() < 20 {
        return None;
    }
    let total_len = be16(packet, 2) as usize;
    let header_len = 4 * (packet[0] & 0x0f) as usize;
    if packet.len() < total_len || header_len < 20 || total_len < header_len {
        return None;
    }

    let ip_off = be16(packet, 6);
    if ip_off & (IP_MF | IP_OFFMASK) == 0 {
        return None;
    }

    let key = FlowKey::V4 {
        src: packet[12..16].try_into().ok()?,
        dst: packet[16..20].try_into().ok()?,
        id: be16(packet, 4),
        proto: packet[9],
    };
    let frag = Fragment {
        offset: 8 * (ip_off & IP_OFFMASK) as usize,
        len: total_len - header_len,
        data_offset: header_len,
        data: packet[..total_len].to_vec(),
        last_nxt: 0,
        ip6f_nxt: 0,
        ts,
    };
    let last_frag = ip_off & IP_MF == 0;
    Some((key, frag, last_frag))
}

fn parse_fragment_v6(packet: &[u8], ts: PktTime) -> Option<(FlowKey, Fragment, bool)> {
    if packet.len() < 40 {
        return None;
    }
    let total_len = be16(packet, 4) as usize + 40;
    if packet.len() < total_len {
        return None;
    }

    // Walk the extension headers that may legitimately precede a Fragment
    // header. An unrecognized header stops the walk and leaves any later
    // Fragment header unseen.
    let mut nxt = packet[6];
    let mut last_nxt = 6;
    let mut offset = 40;
    while nxt == IPPROTO_HOPOPTS || nxt == IPPROTO_ROUTING || nxt == IPPROTO_DSTOPTS {
        if offset + 2 > total_len {
            return None;
        }
        let ext_len = 8 + 8 * packet[offset + 1] as usize;
        if offset + ext_len > total_len {
            return None;
        }
        nxt = packet[offset];
        last_nxt = offset;
        offset += ext_len;
    }

    if nxt != IPPROTO_FRAGMENT {
        return None;
    }
    if offset + 8 > total_len {
        return None;
    }

    let ip6f_nxt = packet[offset];
    let offlg = be16(packet, offset + 2);
    let ident = be32(packet, offset + 4);
    let data_offset = offset + 8;

    let key = FlowKey::V6 {
        src: packet[8..24].try_into().ok()?,
        dst: packet[24..40].try_into().ok()?,
        id: ident,
    };
    let frag = Fragment {
        offset: (offlg & IP6F_OFF_MASK) as usize,
        len: total_len - data_offset,
        data_offset,
        data: packet[..total_len].to_vec(),
        last_nxt,
        ip6f_nxt,
        ts,
    };
    let last_frag = offlg & IP6F_MORE_FRAG == 0;
    Some((key, frag, last_frag))
}

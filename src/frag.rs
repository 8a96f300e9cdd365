//! Container-level fragmentation.
//!
//! When an encoded container exceeds the transport MTU, the sender splits it
//! into `last + 1` pieces tagged `(id, current, last)`. The receiver keys
//! in-flight containers by id in an ordered map, fills slots as pieces
//! arrive, and concatenates once none remain. Entries that never complete
//! are dropped by a garbage collector run whenever a new id is first
//! observed.

use std::collections::BTreeMap;

use crate::container::NmsgFragment;
use crate::error::{Error, Result};

/// Seconds an incomplete container may wait for its remaining pieces.
pub const FRAG_GC_INTERVAL: u64 = 30;

/// Refuse fragment counts beyond this; a hostile `last` would otherwise
/// reserve unbounded slot arrays.
const MAX_FRAGMENTS: u32 = 16 * 1024;

struct FragEntry {
    last: u32,
    remaining: u32,
    ts_sec: u64,
    slots: Vec<Option<Vec<u8>>>,
}

/// Reassembly table for container fragments, keyed by container id.
#[derive(Default)]
pub struct FragTable {
    entries: BTreeMap<u32, FragEntry>,
    dropped: u64,
}

impl FragTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-flight containers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries discarded by the garbage collector.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Insert one fragment. Returns the reassembled container body once the
    /// final piece lands; duplicates are dropped silently.
    pub fn insert(&mut self, frag: NmsgFragment, now_sec: u64) -> Result<Option<Vec<u8>>> {
        if frag.last >= MAX_FRAGMENTS || frag.current > frag.last {
            return Err(Error::Malformed(format!(
                "fragment {}/{} of container {}",
                frag.current, frag.last, frag.id
            )));
        }

        if !self.entries.contains_key(&frag.id) {
            // a fresh id is the cue to sweep stale entries
            self.gc(now_sec);
            self.entries.insert(
                frag.id,
                FragEntry {
                    last: frag.last,
                    remaining: frag.last + 1,
                    ts_sec: now_sec,
                    slots: vec![None; frag.last as usize + 1],
                },
            );
        }

        let entry = match self.entries.get_mut(&frag.id) {
            Some(e) => e,
            None => return Ok(None),
        };
        if entry.last != frag.last {
            return Err(Error::Malformed("fragment count changed mid-container".into()));
        }
        let slot = &mut entry.slots[frag.current as usize];
        if slot.is_some() {
            // already received; network duplicate
            tracing::trace!(id = frag.id, piece = frag.current, "duplicate container fragment");
            return Ok(None);
        }
        *slot = Some(frag.fragment);
        entry.remaining -= 1;

        if entry.remaining != 0 {
            return Ok(None);
        }

        let entry = match self.entries.remove(&frag.id) {
            Some(e) => e,
            None => return Ok(None),
        };
        let total: usize = entry.slots.iter().map(|s| s.as_ref().map_or(0, |b| b.len())).sum();
        // round the allocation up to the next kibibyte
        let padded = if total % 1024 == 0 { total } else { total + 1024 - total % 1024 };
        let mut body = Vec::with_capacity(padded);
        for slot in entry.slots {
            if let Some(piece) = slot {
                body.extend_from_slice(&piece);
            }
        }
        Ok(Some(body))
    }

    /// Drop entries older than [`FRAG_GC_INTERVAL`].
    pub fn gc(&mut self, now_sec: u64) {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now_sec.saturating_sub(e.ts_sec) < FRAG_GC_INTERVAL);
        let swept = before - self.entries.len();
        if swept > 0 {
            self.dropped += swept as u64;
            tracing::debug!(swept, "expired incomplete container fragments");
        }
    }
}

/// Split an encoded container body into MTU-bounded fragments.
///
/// `mtu` bounds the full frame on the wire; the per-piece budget leaves room
/// for the frame header and the fragment wrapper fields.
pub fn split_container(body: &[u8], mtu: usize, id: u32) -> Vec<NmsgFragment> {
    // frame header + wrapper tags/varints for id, current, last, and the
    // fragment bytes field
    const FRAG_OVERHEAD: usize = 32;
    let chunk = mtu.saturating_sub(FRAG_OVERHEAD).max(1);

    let pieces: Vec<&[u8]> = if body.is_empty() {
        vec![&body[..]]
    } else {
        body.chunks(chunk).collect()
    };
    let last = pieces.len() as u32 - 1;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| NmsgFragment {
            id,
            current: i as u32,
            last,
            fragment: piece.to_vec(),
        })
        .collect()
}

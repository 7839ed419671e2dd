//! Fragment reassembly.
//!
//! Collects the fragments of each sequence number until all are present,
//! then delivers the concatenated payload exactly once. Partial sequences
//! older than the previous window are evicted so adversarial loss cannot
//! grow the table without bound.

use std::collections::HashMap;

use crate::error::{ProtocolError, Result};

use super::Frame;

#[derive(Debug)]
struct PendingSeq {
    frag_total: u16,
    window_id: u32,
    parts: HashMap<u16, Vec<u8>>,
}

/// Per-sequence fragment collector.
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    pending: HashMap<u64, PendingSeq>,
}

impl FragmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one fragment.
    ///
    /// Returns `Ok(Some(payload))` when the fragment completes its sequence,
    /// `Ok(None)` while fragments are still outstanding. The `frag_total`
    /// recorded by the first fragment of a sequence is immutable; a later
    /// fragment disagreeing with it is a protocol error.
    pub fn add(&mut self, frame: &Frame) -> Result<Option<Vec<u8>>> {
        if frame.frag_id >= frame.frag_total {
            return Err(ProtocolError::FragmentOutOfRange {
                frag_id: frame.frag_id,
                frag_total: frame.frag_total,
            }
            .into());
        }

        let entry = self.pending.entry(frame.seq).or_insert_with(|| PendingSeq {
            frag_total: frame.frag_total,
            window_id: frame.window_id,
            parts: HashMap::new(),
        });

        if entry.frag_total != frame.frag_total {
            return Err(ProtocolError::FragmentMismatch {
                seq: frame.seq,
                expected: entry.frag_total,
                got: frame.frag_total,
            }
            .into());
        }

        entry.parts.insert(frame.frag_id, frame.payload.clone());

        if entry.parts.len() < entry.frag_total as usize {
            return Ok(None);
        }

        // Complete: concatenate in frag_id order and evict.
        let mut entry = self
            .pending
            .remove(&frame.seq)
            .expect("entry present: inserted above");
        let mut payload = Vec::new();
        for idx in 0..entry.frag_total {
            let part = entry
                .parts
                .remove(&idx)
                .expect("all fragment ids < frag_total present");
            payload.extend_from_slice(&part);
        }
        Ok(Some(payload))
    }

    /// Drop partial sequences from before the previous window.
    ///
    /// Returns the number of sequences evicted.
    pub fn evict_stale(&mut self, current_window: u32) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, entry| entry.window_id + 1 >= current_window);
        before - self.pending.len()
    }

    /// Number of incomplete sequences currently buffered.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

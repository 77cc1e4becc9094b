//! Per-document sequencing.
//!
//! At most one operation per document id may be in flight on a stripe. The
//! sequencer hands out RAII handles keyed by the id's sequencing hash; the
//! handle releases its slot on drop, which happens when the owning operation
//! is destroyed after its reply.

use crate::document::id::DocumentId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Grants per-document mutual exclusion tokens.
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    held: Arc<Mutex<HashSet<u64>>>,
}

impl Sequencer {
    /// Create an empty sequencer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to acquire the handle for a document id.
    ///
    /// Returns `None` while another operation holds the slot.
    pub fn try_acquire(&self, doc_id: &DocumentId) -> Option<SequencingHandle> {
        let key = doc_id.sequencing_hash();
        let mut held = self.held.lock();
        if held.insert(key) {
            Some(SequencingHandle {
                key,
                held: Arc::clone(&self.held),
            })
        } else {
            None
        }
    }

    /// Number of documents currently locked.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

/// Exclusive token for one document id, released on drop.
#[derive(Debug)]
pub struct SequencingHandle {
    key: u64,
    held: Arc<Mutex<HashSet<u64>>>,
}

impl Drop for SequencingHandle {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}

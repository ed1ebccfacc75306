//! Snapshot-published set of modified file offsets.
//!
//! Writers accumulate offsets in a private pending set and publish an
//! immutable snapshot by swapping an `Arc`. Readers take the current
//! snapshot without contending with writers, accepting up to one
//! publication of staleness; a torn set is never observable.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Published set of dirty offsets.
#[derive(Default)]
pub struct DirtyOffsets {
    pending: Mutex<BTreeSet<u64>>,
    published: RwLock<Arc<BTreeSet<u64>>>,
}

impl DirtyOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one modified offset in the pending set.
    pub fn mark(&self, offset: u64) {
        self.pending.lock().insert(offset);
    }

    /// Record `len` consecutive modified offsets starting at `offset`.
    pub fn mark_range(&self, offset: u64, len: u64) {
        let mut pending = self.pending.lock();
        for off in offset..offset.saturating_add(len) {
            pending.insert(off);
        }
    }

    /// Publish the pending set as the new snapshot.
    pub fn publish(&self) {
        let snapshot = Arc::new(self.pending.lock().clone());
        *self.published.write() = snapshot;
    }

    /// Current published snapshot. Never blocks on writers for longer
    /// than the reference swap.
    pub fn snapshot(&self) -> Arc<BTreeSet<u64>> {
        self.published.read().clone()
    }

    /// Drop all pending and published offsets.
    pub fn clear(&self) {
        self.pending.lock().clear();
        *self.published.write() = Arc::new(BTreeSet::new());
    }
}

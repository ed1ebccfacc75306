//! Transactional undo journal.
//!
//! Two stacks under one mutex: per-byte undo entries and transaction
//! boundaries marking how many consecutive entries belong to one script
//! run. The journal is the serialization point between user-initiated
//! undo and script write recording; restores go back through the same
//! [`ByteSource`] the writes came from, and the lock is never held
//! across a source write.

use crate::io::ByteSource;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// One recorded write: old and new bytes at an offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
    pub offset: u64,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

#[derive(Default)]
struct Stacks {
    entries: Vec<UndoEntry>,
    transactions: Vec<usize>,
}

/// Undo history for one loaded file.
#[derive(Default)]
pub struct UndoJournal {
    stacks: Mutex<Stacks>,
}

impl UndoJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one undo entry.
    pub fn record(&self, offset: u64, old: Vec<u8>, new: Vec<u8>) {
        self.stacks.lock().entries.push(UndoEntry { offset, old, new });
    }

    /// Mark the last `count` entries as one transaction. Zero-sized
    /// transactions are not recorded.
    pub fn commit(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.stacks.lock().transactions.push(count);
        debug!(count, "transaction committed");
    }

    /// Number of entries currently on the stack.
    pub fn entry_count(&self) -> usize {
        self.stacks.lock().entries.len()
    }

    /// Number of transaction boundaries currently on the stack.
    pub fn transaction_count(&self) -> usize {
        self.stacks.lock().transactions.len()
    }

    /// Undo the most recent entry, restoring its old bytes. No-op on an
    /// empty stack. Returns whether an entry was undone.
    pub fn undo_one(&self, source: &mut dyn ByteSource) -> bool {
        // Take the entry first so the lock is not held across the write.
        let Some(entry) = self.stacks.lock().entries.pop() else {
            return false;
        };
        restore(source, &entry);
        true
    }

    /// Undo one whole transaction: pop a boundary of `n`, then restore
    /// `n` entries in reverse order. No-op when no boundary exists.
    /// Returns the number of entries restored.
    pub fn undo_transaction(&self, source: &mut dyn ByteSource) -> usize {
        let popped = {
            let mut stacks = self.stacks.lock();
            let Some(count) = stacks.transactions.pop() else {
                return 0;
            };
            let take = count.min(stacks.entries.len());
            let split_at = stacks.entries.len() - take;
            stacks.entries.split_off(split_at)
        };
        for entry in popped.iter().rev() {
            restore(source, entry);
        }
        popped.len()
    }

    /// Drop all history, e.g. when a different file is loaded.
    pub fn clear(&self) {
        let mut stacks = self.stacks.lock();
        stacks.entries.clear();
        stacks.transactions.clear();
    }
}

fn restore(source: &mut dyn ByteSource, entry: &UndoEntry) {
    for (i, &byte) in entry.old.iter().enumerate() {
        if let Err(e) = source.write_u8(entry.offset + i as u64, byte) {
            warn!(offset = entry.offset + i as u64, error = %e, "undo write failed");
        }
    }
}

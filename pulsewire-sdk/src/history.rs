//! Bounded history of recent snapshots.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use pulsewire_types::Snapshot;

/// Number of snapshots kept when no capacity is given (about two minutes at
/// the default 1.5s tick).
pub const DEFAULT_HISTORY_CAPACITY: usize = 84;

/// Fixed-capacity ring of recent snapshots.
///
/// Holds `min(pushed, capacity)` entries in insertion order; pushing into a
/// full ring evicts the oldest. Readers get a copy, so a concurrent push is
/// never observed half-applied.
#[derive(Debug)]
pub struct HistoryRing {
    entries: RwLock<VecDeque<Arc<Snapshot>>>,
    capacity: usize,
}

impl HistoryRing {
    /// Create a ring holding at most `capacity` snapshots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, snapshot: Arc<Snapshot>) {
        let mut entries = self.entries.write();
        entries.push_back(snapshot);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Snapshots oldest first.
    pub fn to_vec(&self) -> Vec<Arc<Snapshot>> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.entries.read().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for HistoryRing {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

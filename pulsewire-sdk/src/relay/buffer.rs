//! Per-topic resume buffer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::RelayEvent;

/// Recently published events of one topic, oldest first.
///
/// Bounded twice: by age (`retention`) and by count (`capacity`). Entries
/// past retention are pruned lazily on push and by the relay's sweeper, and
/// are always filtered out of [`ResumeBuffer::since`] even before pruning.
#[derive(Debug)]
pub(crate) struct ResumeBuffer {
    entries: VecDeque<Arc<RelayEvent>>,
    retention: Duration,
    capacity: usize,
}

impl ResumeBuffer {
    pub(crate) fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            retention,
            capacity,
        }
    }

    pub(crate) fn push(&mut self, event: Arc<RelayEvent>) {
        let now = event.published_at;
        self.entries.push_back(event);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        self.prune(now);
    }

    /// Drop every entry at or past retention. Returns how many were dropped.
    pub(crate) fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        while let Some(front) = self.entries.front() {
            if self.is_live(front, now) {
                break;
            }
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    /// Entries with `seq > after` still inside retention, in order.
    pub(crate) fn since(&self, after: u64, now: Instant) -> impl Iterator<Item = &Arc<RelayEvent>> {
        // Sequence numbers increase along the deque, so skip the prefix.
        let start = self.entries.partition_point(|entry| entry.seq <= after);
        self.entries
            .range(start..)
            .filter(move |entry| self.is_live(entry, now))
    }

    /// Whether every event from `seq` onwards is still replayable.
    pub(crate) fn covers(&self, seq: u64, now: Instant) -> bool {
        self.entries
            .iter()
            .find(|entry| self.is_live(entry, now))
            .is_some_and(|oldest| oldest.seq <= seq)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_live(&self, entry: &RelayEvent, now: Instant) -> bool {
        now.saturating_duration_since(entry.published_at) < self.retention
    }
}

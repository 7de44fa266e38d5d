//! External producers that contribute fragments to each snapshot.

use parking_lot::RwLock;
use pulsewire_types::ExternalSnapshot;
use thiserror::Error;

/// Why a producer could not hand over its latest value.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("producer state unavailable: {0}")]
    Unavailable(String),

    #[error("malformed producer data: {0}")]
    Malformed(String),
}

/// A source of one named fragment in every snapshot.
///
/// Producers do their own I/O on their own schedule (see
/// [`crate::spawn_poller`]) and only hand over a cached value here, so
/// `latest` must be cheap and must not block. An `Err` leaves the previous
/// fragment in place for that tick.
pub trait SnapshotProducer: Send + Sync {
    /// Key under which the fragment appears in `Snapshot::external`.
    fn name(&self) -> &str;

    fn latest(&self) -> Result<ExternalSnapshot, ProducerError>;
}

/// Last published value of a producer.
///
/// The poll task writes, the sampler reads. Starts as
/// [`ExternalSnapshot::Unconfigured`].
#[derive(Debug)]
pub struct LatestValue {
    value: RwLock<ExternalSnapshot>,
}

impl LatestValue {
    pub fn new(initial: ExternalSnapshot) -> Self {
        Self {
            value: RwLock::new(initial),
        }
    }

    pub fn get(&self) -> ExternalSnapshot {
        self.value.read().clone()
    }

    pub fn set(&self, value: ExternalSnapshot) {
        *self.value.write() = value;
    }

    /// Replace the value in place; `f` runs under the write lock.
    pub fn update(&self, f: impl FnOnce(&mut ExternalSnapshot)) {
        f(&mut self.value.write());
    }
}

impl Default for LatestValue {
    fn default() -> Self {
        Self::new(ExternalSnapshot::Unconfigured)
    }
}

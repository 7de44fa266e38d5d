//! Token usage producer backed by a local JSON file.
//!
//! An external sync job writes a [`UsageSyncPayload`] to disk; this producer
//! re-reads it whenever its modification time changes and reports the last
//! 30 days of totals, flagged stale once the payload is older than the
//! configured threshold.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pulsewire_adapters::usage::UsageFileProducer;
//! use pulsewire_sdk::{cancel_pair, spawn_poller, SnapshotProducer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let usage = Arc::new(UsageFileProducer::builder().path("runtime/usage.json").build());
//!     let (_stop, signal) = cancel_pair();
//!     spawn_poller(usage.clone(), usage.policy(), signal);
//!
//!     println!("{:?}", usage.latest());
//! }
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use pulsewire_sdk::{PollOutcome, PollPolicy, Poller, ProducerError, SnapshotProducer};
use pulsewire_types::{
    current_timestamp_ms, ExternalSnapshot, TokenUsage, UsageDay, UsageSyncPayload, UsageTotals,
};
use tracing::{debug, warn};

use crate::AdapterError;

/// Days of history kept from the sync payload.
pub const MAX_DAILY_POINTS: usize = 30;

const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(180 * 60);
const DEFAULT_REFRESH: Duration = Duration::from_secs(30);

/// Producer that reports token usage from a file written by a sync job.
#[derive(Debug)]
pub struct UsageFileProducer {
    path: PathBuf,
    stale_after: Duration,
    refresh: Duration,
    state: Mutex<UsageState>,
}

#[derive(Debug, Default)]
struct UsageState {
    store: Option<UsageStore>,
    last_modified: Option<SystemTime>,
}

/// Normalised contents of the last valid file.
#[derive(Debug, Clone, PartialEq)]
struct UsageStore {
    generated_at: u64,
    latest_day: Option<UsageDay>,
    totals: Option<UsageTotals>,
    daily: Vec<UsageTotals>,
}

impl UsageStore {
    fn from_payload(payload: UsageSyncPayload) -> Self {
        let skip = payload.daily.len().saturating_sub(MAX_DAILY_POINTS);
        let days = &payload.daily[skip..];

        let totals = payload.totals.or_else(|| {
            (!days.is_empty()).then(|| UsageTotals {
                total_tokens: days.iter().map(|d| d.total_tokens).sum(),
            })
        });

        Self {
            generated_at: payload.generated_at,
            latest_day: days.last().copied(),
            totals,
            daily: days
                .iter()
                .map(|d| UsageTotals {
                    total_tokens: d.total_tokens,
                })
                .collect(),
        }
    }

    fn to_usage(&self, now_ms: u64, stale_after: Duration) -> TokenUsage {
        let age = Duration::from_millis(now_ms.saturating_sub(self.generated_at));
        TokenUsage {
            generated_at: Some(self.generated_at),
            is_stale: age > stale_after,
            latest_day: self.latest_day,
            totals: self.totals,
            daily: self.daily.clone(),
        }
    }
}

impl UsageFileProducer {
    pub fn builder() -> UsageFileProducerBuilder {
        UsageFileProducerBuilder::default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Poll every refresh interval regardless of outcome.
    pub fn policy(&self) -> PollPolicy {
        PollPolicy::fixed(self.refresh)
    }

    /// Re-read the file if it changed since the last successful read.
    ///
    /// Returns `Ok(true)` when new contents were loaded. A missing file
    /// resets the producer to empty; an unreadable or invalid file leaves
    /// the previous contents in place and returns the error.
    pub async fn refresh(&self) -> Result<bool, AdapterError> {
        let modified = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.modified().ok(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let mut state = self.state.lock();
                let had_data = state.store.take().is_some();
                state.last_modified = None;
                if had_data {
                    debug!(path = %self.path.display(), "usage file removed, reset to empty");
                }
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        {
            let state = self.state.lock();
            if modified.is_some() && state.last_modified == modified {
                return Ok(false);
            }
        }

        let raw = tokio::fs::read_to_string(&self.path).await?;
        let payload: UsageSyncPayload = serde_json::from_str(&raw)?;
        let store = UsageStore::from_payload(payload);

        let mut state = self.state.lock();
        state.store = Some(store);
        state.last_modified = modified;
        Ok(true)
    }

    fn snapshot_at(&self, now_ms: u64) -> TokenUsage {
        match &self.state.lock().store {
            Some(store) => store.to_usage(now_ms, self.stale_after),
            None => TokenUsage::empty(),
        }
    }
}

impl SnapshotProducer for UsageFileProducer {
    fn name(&self) -> &str {
        "usage"
    }

    fn latest(&self) -> Result<ExternalSnapshot, ProducerError> {
        Ok(ExternalSnapshot::TokenUsage(
            self.snapshot_at(current_timestamp_ms()),
        ))
    }
}

#[async_trait]
impl Poller for UsageFileProducer {
    fn name(&self) -> &str {
        "usage"
    }

    async fn poll(&self) -> PollOutcome {
        match self.refresh().await {
            Ok(changed) => {
                if changed {
                    debug!(path = %self.path.display(), "usage file reloaded");
                }
                PollOutcome::Active
            }
            Err(error) => {
                warn!(path = %self.path.display(), %error, "ignoring unreadable usage file");
                PollOutcome::Failed
            }
        }
    }
}

/// Builder for [`UsageFileProducer`].
#[derive(Debug, Default)]
pub struct UsageFileProducerBuilder {
    path: Option<PathBuf>,
    stale_after: Option<Duration>,
    refresh: Option<Duration>,
}

impl UsageFileProducerBuilder {
    /// Set the file path (default: "runtime/usage.json").
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Age after which the payload is reported stale (default: 180 minutes).
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    /// How often the file's mtime is checked (default: 30 seconds).
    pub fn refresh(mut self, refresh: Duration) -> Self {
        self.refresh = Some(refresh);
        self
    }

    pub fn build(self) -> UsageFileProducer {
        UsageFileProducer {
            path: self
                .path
                .unwrap_or_else(|| PathBuf::from("runtime/usage.json")),
            stale_after: self
                .stale_after
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_STALE_AFTER),
            refresh: self.refresh.unwrap_or(DEFAULT_REFRESH),
            state: Mutex::new(UsageState::default()),
        }
    }
}

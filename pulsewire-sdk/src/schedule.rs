//! Self-scheduling poll loops for external producers.
//!
//! Each producer decides its next delay from the outcome of the previous
//! poll: a fast cadence while there is activity, a slow one when idle, and
//! the server's `Retry-After` (or a fallback) after a rate-limit response.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;

/// Result of one poll, as far as scheduling is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Something is happening; poll again at the normal interval.
    Active,
    /// Nothing to report; back off to the idle interval.
    Idle,
    /// The upstream asked us to slow down.
    RateLimited { retry_after: Option<Duration> },
    /// Transport or decode failure.
    Failed,
}

/// How long to wait after each kind of outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub idle_interval: Duration,
    pub rate_limit_fallback: Duration,
    pub failure_backoff: Duration,
    /// Upper bound for any server-provided retry hint.
    pub max_delay: Duration,
}

impl PollPolicy {
    /// Same delay for every outcome.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            idle_interval: interval,
            rate_limit_fallback: interval,
            failure_backoff: interval,
            max_delay: interval.max(Duration::from_secs(3600)),
        }
    }

    pub fn with_idle_interval(mut self, idle: Duration) -> Self {
        self.idle_interval = idle;
        self
    }

    pub fn with_rate_limit_fallback(mut self, fallback: Duration) -> Self {
        self.rate_limit_fallback = fallback;
        self
    }

    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }

    pub fn next_delay(&self, outcome: &PollOutcome) -> Duration {
        match outcome {
            PollOutcome::Active => self.interval,
            PollOutcome::Idle => self.idle_interval,
            PollOutcome::RateLimited {
                retry_after: Some(hint),
            } if !hint.is_zero() => (*hint).min(self.max_delay),
            PollOutcome::RateLimited { .. } => self.rate_limit_fallback,
            PollOutcome::Failed => self.failure_backoff,
        }
    }
}

/// A producer's fetch step.
///
/// `poll` performs I/O, stores whatever it learned wherever the producer
/// keeps its latest value, and reports how it went.
#[async_trait]
pub trait Poller: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn poll(&self) -> PollOutcome;
}

/// Run `poller` until `cancel` fires.
///
/// The first poll happens immediately. Cancellation interrupts both an
/// in-flight poll and the wait between polls.
pub fn spawn_poller(
    poller: Arc<dyn Poller>,
    policy: PollPolicy,
    mut cancel: CancelSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let outcome = tokio::select! {
                outcome = poller.poll() => outcome,
                _ = cancel.cancelled() => break,
            };

            let delay = policy.next_delay(&outcome);
            match outcome {
                PollOutcome::RateLimited { .. } => {
                    warn!(producer = poller.name(), ?delay, "rate limited, backing off");
                }
                PollOutcome::Failed => {
                    debug!(producer = poller.name(), ?delay, "poll failed");
                }
                PollOutcome::Active | PollOutcome::Idle => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }
        debug!(producer = poller.name(), "poller stopped");
    })
}

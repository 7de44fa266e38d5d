//! # pulsewire-sdk
//!
//! The realtime core of pulsewire: a periodic snapshot sampler with a
//! bounded history, and a topic relay that fans position events out to
//! every connected client with a short resume window.
//!
//! Nothing in this crate knows about HTTP; the gateway in the `pulsewire`
//! crate adapts these types to SSE and WebSocket connections.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pulsewire_sdk::{cancel_pair, Relay, Sampler, SubscribeOptions, SystemProbe};
//! use pulsewire_types::{PositionEvent, SenderId};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let relay = Arc::new(Relay::default());
//!     let sampler = Arc::new(
//!         Sampler::builder(SystemProbe::new())
//!             .relay(relay.clone(), "cursors")
//!             .build(),
//!     );
//!     sampler.start(Duration::from_millis(1500));
//!
//!     let (_close, signal) = cancel_pair();
//!     let mut sub = relay.subscribe(
//!         "cursors",
//!         SubscribeOptions::default().origin(SenderId::from("viewer")),
//!         signal,
//!     );
//!
//!     relay.publish("cursors", PositionEvent::new("someone", 10.0, 20.0));
//!     let event = sub.recv().await.unwrap();
//!     assert_eq!(event.seq, 1);
//!     println!("{} subscribers", sampler.sample().subscriber_count);
//! }
//! ```
//!
//! ## Pieces
//!
//! - [`Sampler`]: single-writer periodic snapshot assembly.
//! - [`HistoryRing`]: the last N snapshots, oldest first.
//! - [`Relay`] / [`Subscription`]: per-topic ordered fan-out with resume.
//! - [`spawn_poller`] / [`PollPolicy`]: adaptive polling for producers.
//! - [`ConnectionCounters`]: lock-free live connection counts.

mod cancel;
mod counters;
mod history;
mod probe;
mod producer;
mod relay;
mod sampler;
mod schedule;

pub mod prometheus;

pub use cancel::{cancel_pair, CancelSignal, Canceller};
pub use counters::{ConnectionCounters, ConnectionGuard, ConnectionKind};
pub use history::{HistoryRing, DEFAULT_HISTORY_CAPACITY};
pub use probe::{HostProbe, HostReading};
#[cfg(feature = "system")]
pub use probe::SystemProbe;
pub use producer::{LatestValue, ProducerError, SnapshotProducer};
pub use relay::{
    PublishReport, Relay, RelayConfig, RelayEvent, SubscribeOptions, Subscription,
};
pub use sampler::{Sampler, SamplerBuilder, DEFAULT_SAMPLE_INTERVAL};
pub use schedule::{spawn_poller, PollOutcome, PollPolicy, Poller};

// Re-export types for convenience
pub use pulsewire_types::{ExternalSnapshot, PositionEvent, SenderId, Snapshot};

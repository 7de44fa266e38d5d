//! # pulsewire-adapters
//!
//! Pre-built producers that contribute external fragments to pulsewire
//! snapshots.
//!
//! Each producer keeps its latest value in memory and refreshes it on its
//! own schedule via [`pulsewire_sdk::spawn_poller`]; the sampler only ever
//! reads the cached value, so a slow or failing upstream never delays a
//! snapshot.
//!
//! ## Supported Sources
//!
//! - **GitHub** (`github` feature) - Commit counts for the last seven days
//!   and year to date via the commit search API
//! - **Spotify** (`spotify` feature) - Currently playing track via the Web
//!   API refresh-token flow
//! - **Token usage** (`usage` feature) - A JSON file written by a local sync
//!   job, re-read when its modification time changes
//!
//! ## Quick Start (GitHub)
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pulsewire_adapters::github::GitHubProducer;
//! use pulsewire_sdk::{cancel_pair, spawn_poller};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let producer = Arc::new(
//!         GitHubProducer::builder()
//!             .username("octocat")
//!             .build()?,
//!     );
//!
//!     let (_stop, signal) = cancel_pair();
//!     let task = spawn_poller(producer.clone(), GitHubProducer::policy(), signal);
//!     task.await?;
//!     Ok(())
//! }
//! ```

pub mod error;

#[cfg(feature = "github")]
pub mod github;

#[cfg(feature = "spotify")]
pub mod spotify;

#[cfg(feature = "usage")]
pub mod usage;

pub use error::AdapterError;

// Re-export types for convenience
pub use pulsewire_types::{CommitStats, ExternalSnapshot, NowPlaying, TokenUsage};

//! # pulsewire-types
//!
//! Wire types shared by every pulsewire crate. This crate defines what
//! travels over the snapshot stream and the position channel, and nothing
//! about how it gets there.
//!
//! ## Overview
//!
//! - [`Snapshot`]: one immutable point-in-time metrics record, built through
//!   [`SnapshotBuilder`] which enforces the "finite and non-negative" rule
//!   for every gauge.
//! - [`ExternalSnapshot`]: the fragment an external producer contributes to
//!   a snapshot (now playing, commit counts, token usage) or the
//!   [`ExternalSnapshot::Unconfigured`] sentinel.
//! - [`PositionEvent`]: a pointer coordinate update with parse-or-reject
//!   validation at the boundary ([`PositionEvent::parse`]).
//!
//! ## Example
//!
//! ```rust
//! use pulsewire_types::{PositionEvent, Snapshot};
//!
//! let snapshot = Snapshot::builder()
//!     .uptime_seconds(42)
//!     .cpu_usage_percent(12.3456)
//!     .build();
//! assert_eq!(snapshot.cpu_usage_percent, 12.35);
//!
//! let event = PositionEvent::parse(r#"{"id":"a1","x":5,"y":9}"#).unwrap();
//! assert_eq!(event.x, 5.0);
//! assert!(PositionEvent::parse(r#"{"id":"a1"}"#).is_err());
//! ```
//!
//! All types serialize as camelCase JSON.

mod external;
mod position;
mod snapshot;

pub use external::*;
pub use position::*;
pub use snapshot::*;

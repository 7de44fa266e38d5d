//! # pulsewire
//!
//! A realtime telemetry relay. A sampler captures a host and producer
//! snapshot on a fixed cadence and keeps a short history; a relay fans
//! pointer positions out between connected browsers with a resume window.
//! This crate puts both behind HTTP.
//!
//! ## Architecture
//!
//! ```text
//!  producers ──▶ Sampler ──▶ history / latest ──▶ GET /api/stats[/history]
//!  (github,        │                          └─▶ GET /api/stats/stream (SSE)
//!   spotify,       │
//!   usage)         └── subscriber count ◀──┐
//!                                          │
//!  browser ──ws──▶ /api/live ──publish──▶ Relay ──fan-out──▶ other browsers
//! ```
//!
//! - **[`config`]**: layered settings (defaults, TOML file, `PULSEWIRE_*`
//!   environment)
//! - **[`gateway`]**: axum routes, the SSE stream, the position socket and
//!   session identity
//! - **[`service`]**: builds and runs the sampler, relay, sweeper and
//!   producer pollers from [`Settings`]
//!
//! The realtime machinery itself lives in `pulsewire-sdk`; the producers in
//! `pulsewire-adapters`.
//!
//! ## Usage
//!
//! ### As a server
//!
//! ```bash
//! pulsewire --config pulsewire.toml
//! PORT=8080 RUST_LOG=pulsewire=debug pulsewire
//! ```
//!
//! ### Embedded
//!
//! ```no_run
//! use pulsewire::{gateway, Service, Settings};
//! use pulsewire_sdk::cancel_pair;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = Settings::load(None)?;
//! let (stop, shutdown) = cancel_pair();
//! let service = Service::start(&settings, shutdown)?;
//!
//! let listener = tokio::net::TcpListener::bind(settings.server.bind).await?;
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     stop.cancel();
//! });
//! gateway::serve(listener, service.state()).await?;
//! service.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod gateway;
pub mod service;

pub use config::Settings;
pub use gateway::AppState;
pub use service::Service;

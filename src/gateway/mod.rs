//! HTTP surface: snapshot endpoints, the SSE stream, the position socket and
//! Prometheus metrics, served with axum.
//!
//! | Route | |
//! |-------|---|
//! | `GET /health` | `ok` |
//! | `GET /api/stats` | latest snapshot |
//! | `GET /api/stats/history` | history ring, oldest first |
//! | `GET /api/stats/stream` | SSE, one `stats` event per tick |
//! | `GET /api/live/id` | public sender id for this session |
//! | `GET /api/live` | position WebSocket |
//! | `GET /metrics` | Prometheus text |

mod identity;
mod live;
mod metrics;
mod stats;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use pulsewire_sdk::{CancelSignal, Relay, Sampler};
use tokio::net::TcpListener;
use tracing::info;

pub use identity::{sender_id_for, Identity, Session};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub sampler: Arc<Sampler>,
    pub relay: Arc<Relay>,
    /// Relay topic the position socket publishes to.
    pub topic: Arc<str>,
    pub identity: Arc<Identity>,
    /// Fires on server shutdown; ends streams and sockets so the server can drain.
    pub shutdown: CancelSignal,
}

/// Build the router for `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats::latest))
        .route("/api/stats/history", get(stats::history))
        .route("/api/stats/stream", get(stats::stream))
        .route("/api/live/id", get(live::identify))
        .route("/api/live", get(live::socket))
        .route("/metrics", get(metrics::render))
        .with_state(state)
}

/// Serve on `listener` until `state.shutdown` fires, then drain.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    let mut shutdown = state.shutdown.clone();
    let app = router(state);

    info!("Listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Gateway received shutdown signal, draining connections");
        })
        .await
        .context("gateway server failed")?;

    info!("Gateway stopped");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

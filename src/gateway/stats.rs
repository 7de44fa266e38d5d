//! Snapshot endpoints: latest, history and the SSE stream.

use std::convert::Infallible;

use axum::extract::State;
use axum::http::header::CACHE_CONTROL;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::stream;
use pulsewire_sdk::{ConnectionKind, Snapshot};
use tracing::{debug, warn};

use super::AppState;

pub(super) async fn latest(State(state): State<AppState>) -> Json<Snapshot> {
    Json(Snapshot::clone(&state.sampler.latest()))
}

/// The history ring, oldest first. Never cached.
pub(super) async fn history(State(state): State<AppState>) -> impl IntoResponse {
    let history = state.sampler.history();
    let body: Vec<&Snapshot> = history.iter().map(|s| s.as_ref()).collect();
    ([(CACHE_CONTROL, "no-store")], Json(body)).into_response()
}

/// One `stats` event with the current snapshot, then one per sampler tick.
///
/// The stream ends when the client goes away (axum drops it) or the server
/// shuts down.
pub(super) async fn stream(State(state): State<AppState>) -> impl IntoResponse {
    let guard = state.sampler.counters().open(ConnectionKind::Stream);
    let mut updates = state.sampler.watch();
    updates.mark_changed();
    let shutdown = state.shutdown.clone();
    debug!("stats stream opened");

    let events = stream::unfold(
        (updates, shutdown, guard),
        |(mut updates, mut shutdown, guard)| async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                changed = updates.changed() => {
                    changed.ok()?;
                    let snapshot = updates.borrow_and_update().clone();
                    Some((stats_event(&snapshot), (updates, shutdown, guard)))
                }
            }
        },
    );

    (
        [(CACHE_CONTROL, "no-cache")],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
}

fn stats_event(snapshot: &Snapshot) -> Result<Event, Infallible> {
    Ok(match serde_json::to_string(snapshot) {
        Ok(json) => Event::default().event("stats").data(json),
        Err(error) => {
            warn!(%error, "failed to encode snapshot");
            Event::default().comment("encode error")
        }
    })
}

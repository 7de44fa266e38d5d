use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use pulsewire_sdk::prometheus::{self, format_prometheus};

use super::AppState;

const NAMESPACE: &str = "pulsewire";

/// Prometheus text rendering of the latest snapshot.
pub(super) async fn render(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.sampler.latest();
    (
        [(CONTENT_TYPE, prometheus::CONTENT_TYPE)],
        format_prometheus(&snapshot, Some(NAMESPACE)),
    )
}

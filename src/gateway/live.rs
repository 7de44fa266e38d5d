//! The position channel: identity lookup and the WebSocket relay bridge.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, SET_COOKIE};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use futures_util::{SinkExt, StreamExt};
use pulsewire_sdk::{cancel_pair, ConnectionKind, PublishReport, SubscribeOptions};
use pulsewire_types::{PositionEvent, RelayFrame, SenderId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::AppState;

#[derive(Debug, Serialize)]
struct IdResponse<'a> {
    id: &'a str,
}

/// `{ "id": <sender id> }` for this browser, minting the session if needed.
pub(super) async fn identify(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = state.identity.resolve(&headers);
    let sender = session.sender_id();
    let mut response = (
        [(CACHE_CONTROL, "no-store")],
        Json(IdResponse {
            id: sender.as_str(),
        }),
    )
        .into_response();
    state.identity.attach(&session, &mut response);
    response
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct LiveParams {
    #[serde(rename = "lastEventId")]
    last_event_id: Option<String>,
}

impl LiveParams {
    /// Garbage is treated as "no marker" rather than rejecting the upgrade.
    fn resume_after(&self) -> Option<u64> {
        self.last_event_id.as_deref()?.trim().parse().ok()
    }
}

pub(super) async fn socket(
    State(state): State<AppState>,
    Query(params): Query<LiveParams>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let session = state.identity.resolve(&headers);
    let sender = session.sender_id();
    let resume_after = params.resume_after();

    let cookie = state.identity.set_cookie(&session);

    let mut response =
        upgrade.on_upgrade(move |socket| run_socket(socket, state, sender, resume_after));
    if let Some(cookie) = cookie {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    response
}

/// Bridge one socket to the relay until either side closes or the server
/// shuts down.
async fn run_socket(
    socket: WebSocket,
    state: AppState,
    sender: SenderId,
    resume_after: Option<u64>,
) {
    let _guard = state.sampler.counters().open(ConnectionKind::Socket);
    let (cancel, signal) = cancel_pair();

    let mut options = SubscribeOptions::default().origin(sender.clone());
    if let Some(seq) = resume_after {
        options = options.resume_after(seq);
    }
    let mut subscription = state.relay.subscribe(&state.topic, options, signal);
    let stamp_seq = state.relay.resume_enabled();
    debug!(
        sender = sender.as_str(),
        ?resume_after,
        replay = subscription.pending_replay(),
        "position socket opened"
    );

    let (mut outbound, mut inbound) = socket.split();
    let mut shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let frame = RelayFrame {
                    event: event.event.clone(),
                    seq: stamp_seq.then_some(event.seq),
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(%error, "failed to encode position frame");
                        continue;
                    }
                };
                if outbound.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            message = inbound.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    accept(&state, &sender, text.as_str().as_bytes());
                }
                Some(Ok(Message::Binary(bytes))) => {
                    accept(&state, &sender, &bytes);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(sender = sender.as_str(), %error, "position socket error");
                    break;
                }
            }
        }
    }

    subscription.unsubscribe();
    cancel.cancel();
    let _ = outbound.close().await;
    debug!(sender = sender.as_str(), "position socket closed");
}

/// Validate an inbound frame and publish it as `sender`.
///
/// Malformed payloads and payloads claiming another sender's id are dropped;
/// the connection stays open either way.
pub(crate) fn accept(state: &AppState, sender: &SenderId, raw: &[u8]) -> Option<PublishReport> {
    let event = match PositionEvent::from_slice(raw) {
        Ok(event) => event,
        Err(error) => {
            debug!(sender = sender.as_str(), %error, "dropping malformed position");
            return None;
        }
    };

    if event.id != sender.as_str() {
        debug!(
            sender = sender.as_str(),
            claimed = %event.id,
            "dropping position with mismatched id"
        );
        return None;
    }

    Some(state.relay.publish(&state.topic, event))
}

//! End-to-end tests against a gateway bound to an ephemeral port.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use pulsewire::gateway::{self, sender_id_for};
use pulsewire::{AppState, Service, Settings};
use pulsewire_sdk::{cancel_pair, Canceller, HostReading};
use pulsewire_types::{PositionEvent, RelayFrame, Snapshot};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOKEN_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const TOKEN_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

struct Harness {
    addr: SocketAddr,
    state: AppState,
    stop: Canceller,
    server: JoinHandle<anyhow::Result<()>>,
    service: Service,
    _dir: TempDir,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(configure: impl FnOnce(&mut Settings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::load_from(None, Some(HashMap::new())).unwrap();
        settings.usage.file = dir.path().join("usage.json");
        settings.sampler.interval_ms = 50;
        configure(&mut settings);

        let (stop, shutdown) = cancel_pair();
        let probe = || HostReading {
            memory_rss_bytes: Some(64 * 1024 * 1024),
            system_memory_used_percent: Some(40.0),
            system_memory_total_bytes: Some(8 * 1024 * 1024 * 1024),
            system_memory_free_bytes: Some(4915 * 1024 * 1024),
            cpu_count: Some(4),
            cpu_usage_percent: None,
            load_average: Some([0.5, 0.25, 0.125]),
        };
        let service = Service::start_with_probe(&settings, shutdown, probe).unwrap();
        let state = service.state();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(gateway::serve(listener, service.state()));

        Self {
            addr,
            state,
            stop,
            server,
            service,
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn socket(&self, token: &str, query: &str) -> Socket {
        let mut request = format!("ws://{}/api/live{}", self.addr, query)
            .into_client_request()
            .unwrap();
        request.headers_mut().insert(
            "cookie",
            format!("pulsewire_sid={}", token).parse().unwrap(),
        );
        let (socket, _) = connect_async(request).await.unwrap();
        socket
    }

    async fn wait_for_subscribers(&self, count: usize) {
        let relay = self.state.relay.clone();
        let topic = self.state.topic.clone();
        wait_until(move || {
            let relay = relay.clone();
            let topic = topic.clone();
            async move { relay.subscriber_count(&topic) == count }
        })
        .await;
    }

    async fn shutdown(self) {
        self.stop.cancel();
        timeout(Duration::from_secs(5), self.server)
            .await
            .expect("server did not drain")
            .unwrap()
            .unwrap();
        self.service.stop().await;
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn position(token: &str, x: f64, y: f64) -> Message {
    let event = PositionEvent::new(sender_id_for(token).as_str(), x, y);
    Message::Text(serde_json::to_string(&event).unwrap().into())
}

async fn next_frame(socket: &mut Socket) -> RelayFrame {
    loop {
        let message = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no frame received")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn assert_silent(socket: &mut Socket) {
    let next = timeout(Duration::from_millis(200), socket.next()).await;
    assert!(next.is_err(), "unexpected frame: {:?}", next);
}

#[tokio::test]
async fn health_check() {
    let harness = Harness::start().await;
    let body = reqwest::get(harness.url("/health")).await.unwrap().text().await.unwrap();
    assert_eq!(body, "ok");
    harness.shutdown().await;
}

#[tokio::test]
async fn stats_reports_probe_and_producers() {
    let harness = Harness::start().await;

    let snapshot: Snapshot = reqwest::get(harness.url("/api/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(snapshot.memory_rss_mb, 64.0);
    assert_eq!(snapshot.system_memory_used_percent, 40.0);
    assert_eq!(snapshot.system_memory_total_mb, 8192.0);
    assert_eq!(snapshot.system_memory_free_mb, 4915.0);
    assert_eq!(snapshot.cpu_count, 4);
    assert_eq!(snapshot.cpu_usage_percent, 0.0);
    assert_eq!(snapshot.load_average, [0.5, 0.25, 0.13]);
    assert_eq!(snapshot.app_version, env!("CARGO_PKG_VERSION"));
    assert!(!snapshot.external("github").unwrap().is_configured());
    assert!(!snapshot.external("spotify").unwrap().is_configured());
    assert!(snapshot.external("usage").unwrap().is_configured());

    harness.shutdown().await;
}

#[tokio::test]
async fn history_is_ordered_and_not_cached() {
    let harness = Harness::start().await;
    let sampler = harness.state.sampler.clone();
    wait_until(move || {
        let sampler = sampler.clone();
        async move { sampler.history().len() >= 3 }
    })
    .await;

    let response = reqwest::get(harness.url("/api/stats/history")).await.unwrap();
    assert_eq!(response.headers()["cache-control"], "no-store");

    let history: Vec<Snapshot> = response.json().await.unwrap();
    assert!(history.len() >= 3);
    assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    harness.shutdown().await;
}

/// Next `stats` event on an SSE body, or `None` if the body ended.
async fn next_stats<S, B>(body: &mut S, buffer: &mut String) -> Option<Snapshot>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    loop {
        while let Some(end) = buffer.find("\n\n") {
            let block: String = buffer.drain(..end + 2).collect();
            if block.lines().any(|l| l == "event: stats") {
                let data = block
                    .lines()
                    .find_map(|l| l.strip_prefix("data: "))
                    .unwrap();
                return Some(serde_json::from_str(data).unwrap());
            }
        }
        let chunk = body.next().await?.unwrap();
        buffer.push_str(std::str::from_utf8(chunk.as_ref()).unwrap());
    }
}

#[tokio::test]
async fn stream_emits_stats_events() {
    let harness = Harness::start().await;

    let response = reqwest::get(harness.url("/api/stats/stream")).await.unwrap();
    assert_eq!(response.headers()["cache-control"], "no-cache");
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut body = Box::pin(response.bytes_stream());
    let mut buffer = String::new();
    let mut events = Vec::new();
    while events.len() < 4 {
        let event = timeout(Duration::from_secs(5), next_stats(&mut body, &mut buffer))
            .await
            .expect("stream stalled")
            .expect("stream ended");
        events.push(event);
    }

    assert!(
        events.windows(2).all(|w| w[0].timestamp < w[1].timestamp),
        "snapshot repeated or out of order: {:?}",
        events.iter().map(|e| e.timestamp).collect::<Vec<_>>()
    );
    drop(body);
    harness.shutdown().await;
}

#[tokio::test]
async fn stream_starts_with_latest_and_sends_each_tick_once() {
    // Slow enough that only manual samples happen during the test.
    let harness = Harness::start_with(|s| s.sampler.interval_ms = 3_600_000).await;
    let sampler = harness.state.sampler.clone();

    let latest: Snapshot = reqwest::get(harness.url("/api/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let response = reqwest::get(harness.url("/api/stats/stream")).await.unwrap();
    let mut body = Box::pin(response.bytes_stream());
    let mut buffer = String::new();

    let first = timeout(Duration::from_secs(5), next_stats(&mut body, &mut buffer))
        .await
        .expect("no initial event")
        .unwrap();
    assert_eq!(first, latest);

    for _ in 0..2 {
        let sampled = sampler.sample();
        let event = timeout(Duration::from_secs(5), next_stats(&mut body, &mut buffer))
            .await
            .expect("tick not delivered")
            .unwrap();
        assert_eq!(event, *sampled);
    }

    let extra = timeout(Duration::from_millis(300), next_stats(&mut body, &mut buffer)).await;
    assert!(extra.is_err(), "duplicate snapshot: {:?}", extra);

    drop(body);
    harness.shutdown().await;
}

#[tokio::test]
async fn stream_counts_as_a_connection_while_open() {
    let harness = Harness::start().await;
    let counters = harness.state.sampler.counters().clone();

    let response = reqwest::get(harness.url("/api/stats/stream")).await.unwrap();
    let mut body = response.bytes_stream();
    timeout(Duration::from_secs(5), body.next()).await.unwrap();
    assert_eq!(counters.streams(), 1);

    drop(body);
    let counters_after = counters.clone();
    wait_until(move || {
        let counters = counters_after.clone();
        async move { counters.streams() == 0 }
    })
    .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn live_id_mints_then_recalls() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();

    let first = client.get(harness.url("/api/live/id")).send().await.unwrap();
    let cookie = first.headers()["set-cookie"].to_str().unwrap().to_string();
    assert!(cookie.contains("HttpOnly"));
    let first: serde_json::Value = first.json().await.unwrap();
    let id = first["id"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 16);

    let pair = cookie.split(';').next().unwrap().to_string();
    let second = client
        .get(harness.url("/api/live/id"))
        .header("cookie", pair)
        .send()
        .await
        .unwrap();
    assert!(second.headers().get("set-cookie").is_none());
    let second: serde_json::Value = second.json().await.unwrap();
    assert_eq!(second["id"], id.as_str());

    harness.shutdown().await;
}

#[tokio::test]
async fn socket_relays_to_others_but_not_sender() {
    let harness = Harness::start().await;
    let mut s1 = harness.socket(TOKEN_A, "").await;
    let mut s2 = harness.socket(TOKEN_B, "").await;
    harness.wait_for_subscribers(2).await;

    s1.send(position(TOKEN_A, 5.0, 9.0)).await.unwrap();

    let frame = next_frame(&mut s2).await;
    assert_eq!(frame.event, PositionEvent::new(sender_id_for(TOKEN_A).as_str(), 5.0, 9.0));
    assert_eq!(frame.seq, Some(1));
    assert_silent(&mut s1).await;
    assert_silent(&mut s2).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn malformed_payload_is_dropped_and_socket_stays_open() {
    let harness = Harness::start().await;
    let mut s1 = harness.socket(TOKEN_A, "").await;
    let mut s2 = harness.socket(TOKEN_B, "").await;
    harness.wait_for_subscribers(2).await;

    let id = sender_id_for(TOKEN_A);
    s1.send(Message::Text(format!(r#"{{"id":"{}"}}"#, id).into()))
        .await
        .unwrap();
    s1.send(Message::Text("not json".into())).await.unwrap();
    s1.send(position(TOKEN_A, 1.0, 2.0)).await.unwrap();

    let frame = next_frame(&mut s2).await;
    assert_eq!((frame.event.x, frame.event.y), (1.0, 2.0));
    assert_eq!(frame.seq, Some(1));

    harness.shutdown().await;
}

#[tokio::test]
async fn spoofed_id_is_never_forwarded() {
    let harness = Harness::start().await;
    let mut s1 = harness.socket(TOKEN_A, "").await;
    let mut s2 = harness.socket(TOKEN_B, "").await;
    harness.wait_for_subscribers(2).await;

    // s1 claims to be s2.
    s1.send(position(TOKEN_B, 3.0, 3.0)).await.unwrap();
    s1.send(position(TOKEN_A, 4.0, 4.0)).await.unwrap();

    let frame = next_frame(&mut s2).await;
    assert_eq!(frame.event.id, sender_id_for(TOKEN_A).as_str());
    assert_eq!(frame.event.x, 4.0);
    assert_silent(&mut s2).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn reconnect_resumes_after_last_event_id() {
    let harness = Harness::start().await;
    let mut s1 = harness.socket(TOKEN_A, "").await;
    harness.wait_for_subscribers(1).await;

    for i in 1..=3 {
        s1.send(position(TOKEN_A, i as f64, 0.0)).await.unwrap();
    }
    let relay = harness.state.relay.clone();
    wait_until(move || {
        let relay = relay.clone();
        async move { relay.buffered("cursors") == 3 }
    })
    .await;

    let mut s2 = harness.socket(TOKEN_B, "?lastEventId=1").await;
    let replayed = [next_frame(&mut s2).await, next_frame(&mut s2).await];
    assert_eq!(replayed[0].seq, Some(2));
    assert_eq!(replayed[1].seq, Some(3));
    assert_eq!(replayed[1].event.x, 3.0);
    assert_silent(&mut s2).await;

    s1.send(position(TOKEN_A, 4.0, 0.0)).await.unwrap();
    assert_eq!(next_frame(&mut s2).await.seq, Some(4));

    harness.shutdown().await;
}

#[tokio::test]
async fn frames_omit_seq_without_resume() {
    let harness = Harness::start_with(|settings| settings.relay.resume = false).await;
    let mut s1 = harness.socket(TOKEN_A, "").await;
    let mut s2 = harness.socket(TOKEN_B, "?lastEventId=0").await;
    harness.wait_for_subscribers(2).await;

    s1.send(position(TOKEN_A, 7.0, 7.0)).await.unwrap();
    let frame = next_frame(&mut s2).await;
    assert_eq!(frame.seq, None);
    assert_eq!(harness.state.relay.buffered("cursors"), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn closed_socket_unsubscribes() {
    let harness = Harness::start().await;
    let mut s1 = harness.socket(TOKEN_A, "").await;
    harness.wait_for_subscribers(1).await;

    s1.close(None).await.unwrap();
    harness.wait_for_subscribers(0).await;
    let counters = harness.state.sampler.counters().clone();
    wait_until(move || {
        let counters = counters.clone();
        async move { counters.sockets() == 0 }
    })
    .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn metrics_render_latest_snapshot() {
    let harness = Harness::start().await;

    let response = reqwest::get(harness.url("/metrics")).await.unwrap();
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let body = response.text().await.unwrap();
    assert!(body.contains("# TYPE pulsewire_uptime_seconds gauge"));
    assert!(body.contains("pulsewire_memory_rss_megabytes 64"));

    harness.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_open_streams() {
    let harness = Harness::start().await;
    let _s1 = harness.socket(TOKEN_A, "").await;
    let response = reqwest::get(harness.url("/api/stats/stream")).await.unwrap();
    let mut body = response.bytes_stream();
    timeout(Duration::from_secs(5), body.next()).await.unwrap();

    // Fails if the open stream or socket keeps the server alive.
    harness.shutdown().await;
}

//! The snapshot sampler.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pulsewire_types::{current_timestamp_ms, ExternalSnapshot, Snapshot};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::cancel::{cancel_pair, Canceller};
use crate::counters::ConnectionCounters;
use crate::history::{HistoryRing, DEFAULT_HISTORY_CAPACITY};
use crate::probe::HostProbe;
use crate::producer::SnapshotProducer;
use crate::relay::Relay;

/// Default sampling period.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(1500);

/// Periodically assembles a [`Snapshot`] from the host probe, the live
/// connection counters and every registered producer.
///
/// The sampler is the only writer of its latest value and its history; both
/// are readable from any task at any time. Before the first tick the latest
/// value is [`Snapshot::empty`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use pulsewire_sdk::{Sampler, SystemProbe, DEFAULT_SAMPLE_INTERVAL};
///
/// #[tokio::main]
/// async fn main() {
///     let sampler = Arc::new(Sampler::builder(SystemProbe::new()).build());
///     sampler.start(DEFAULT_SAMPLE_INTERVAL);
///
///     let mut updates = sampler.watch();
///     while updates.changed().await.is_ok() {
///         let snapshot = updates.borrow_and_update().clone();
///         println!("cpu {}%", snapshot.cpu_usage_percent);
///     }
/// }
/// ```
pub struct Sampler {
    probe: Mutex<Box<dyn HostProbe>>,
    producers: Vec<Arc<dyn SnapshotProducer>>,
    counters: Arc<ConnectionCounters>,
    relay: Option<(Arc<Relay>, String)>,
    app_version: String,
    started: Instant,
    history: HistoryRing,
    latest: watch::Sender<Arc<Snapshot>>,
    task: Mutex<Option<SamplerTask>>,
}

struct SamplerTask {
    canceller: Canceller,
    handle: JoinHandle<()>,
}

impl Sampler {
    pub fn builder(probe: impl HostProbe + 'static) -> SamplerBuilder {
        SamplerBuilder::new(probe)
    }

    /// Take one snapshot now.
    ///
    /// Readings the probe cannot supply become 0. A producer that errors or
    /// panics keeps its fragment from the previous snapshot (or is left out
    /// if it never produced one); the other producers are unaffected.
    pub fn sample(&self) -> Arc<Snapshot> {
        // The probe lock doubles as the single-writer lock.
        let mut probe = self.probe.lock();
        let reading = probe.read();
        let previous = self.latest.borrow().clone();

        let mut builder = Snapshot::builder()
            .timestamp(current_timestamp_ms())
            .app_version(self.app_version.clone())
            .uptime_seconds(self.started.elapsed().as_secs())
            .memory_rss_mb(reading.memory_rss_mb())
            .system_memory_used_percent(reading.system_memory_used_percent.unwrap_or(0.0))
            .system_memory_total_mb(reading.system_memory_total_mb())
            .system_memory_free_mb(reading.system_memory_free_mb())
            .cpu_count(reading.cpu_count.unwrap_or(0) as u64)
            .cpu_usage_percent(reading.cpu_usage_percent.unwrap_or(0.0))
            .load_average(reading.load_average.unwrap_or([0.0; 3]))
            .pending_connections(self.counters.total());

        if let Some((relay, topic)) = &self.relay {
            builder = builder.subscriber_count(relay.subscriber_count(topic) as u64);
        }

        for producer in &self.producers {
            if let Some(fragment) = fragment_of(producer.as_ref(), &previous) {
                builder = builder.external(producer.name(), fragment);
            }
        }

        let snapshot = Arc::new(builder.build());
        self.history.push(snapshot.clone());
        self.latest.send_replace(snapshot.clone());
        snapshot
    }

    /// Start sampling every `interval`, taking the first sample immediately.
    ///
    /// Returns `false` without doing anything if already running, so there
    /// is never more than one timer. Must be called within a tokio runtime.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        let mut task = self.task.lock();
        if task.is_some() {
            debug!("sampler already running");
            return false;
        }

        self.sample();

        let (canceller, mut stop) = cancel_pair();
        let sampler = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; that sample was taken above.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(sampler) = sampler.upgrade() else { break };
                        sampler.sample();
                    }
                    _ = stop.cancelled() => break,
                }
            }
            debug!("sampler stopped");
        });

        *task = Some(SamplerTask { canceller, handle });
        debug!(?interval, "sampler started");
        true
    }

    /// Stop the periodic task. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        match self.task.lock().take() {
            Some(task) => {
                task.canceller.cancel();
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// The most recent snapshot.
    pub fn latest(&self) -> Arc<Snapshot> {
        self.latest.borrow().clone()
    }

    /// Recent snapshots, oldest first.
    pub fn history(&self) -> Vec<Arc<Snapshot>> {
        self.history.to_vec()
    }

    /// Receiver that observes every new latest snapshot.
    ///
    /// A slow receiver sees only the newest value when it catches up.
    pub fn watch(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.latest.subscribe()
    }

    pub fn counters(&self) -> &Arc<ConnectionCounters> {
        &self.counters
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.handle.abort();
        }
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("producers", &self.producers.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("history", &self.history.len())
            .field("running", &self.is_running())
            .finish()
    }
}

fn fragment_of(producer: &dyn SnapshotProducer, previous: &Snapshot) -> Option<ExternalSnapshot> {
    let name = producer.name();
    match panic::catch_unwind(AssertUnwindSafe(|| producer.latest())) {
        Ok(Ok(fragment)) => Some(fragment),
        Ok(Err(error)) => {
            warn!(producer = name, %error, "producer failed, keeping previous value");
            previous.external(name).cloned()
        }
        Err(_) => {
            warn!(producer = name, "producer panicked, keeping previous value");
            previous.external(name).cloned()
        }
    }
}

/// Builder for [`Sampler`].
pub struct SamplerBuilder {
    probe: Box<dyn HostProbe>,
    producers: Vec<Arc<dyn SnapshotProducer>>,
    counters: Option<Arc<ConnectionCounters>>,
    relay: Option<(Arc<Relay>, String)>,
    app_version: Option<String>,
    history: usize,
}

impl SamplerBuilder {
    pub fn new(probe: impl HostProbe + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            producers: Vec::new(),
            counters: None,
            relay: None,
            app_version: None,
            history: DEFAULT_HISTORY_CAPACITY,
        }
    }

    pub fn producer(mut self, producer: Arc<dyn SnapshotProducer>) -> Self {
        self.producers.push(producer);
        self
    }

    /// Share connection counters with whoever opens connections.
    pub fn counters(mut self, counters: Arc<ConnectionCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Report the subscriber count of `topic` on `relay`.
    pub fn relay(mut self, relay: Arc<Relay>, topic: impl Into<String>) -> Self {
        self.relay = Some((relay, topic.into()));
        self
    }

    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    /// Number of snapshots kept in history.
    pub fn history(mut self, capacity: usize) -> Self {
        self.history = capacity;
        self
    }

    pub fn build(self) -> Sampler {
        let (latest, _) = watch::channel(Arc::new(Snapshot::empty()));
        Sampler {
            probe: Mutex::new(self.probe),
            producers: self.producers,
            counters: self.counters.unwrap_or_default(),
            relay: self.relay,
            app_version: self
                .app_version
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            started: Instant::now(),
            history: HistoryRing::new(self.history),
            latest,
            task: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::counters::ConnectionKind;
    use crate::probe::HostReading;
    use crate::producer::ProducerError;
    use crate::relay::SubscribeOptions;
    use pulsewire_types::{NowPlaying, TokenUsage};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Probe whose RSS counts up in whole MiB, one per read.
    fn counting_probe() -> impl HostProbe {
        let mut reads = 0u64;
        move || {
            reads += 1;
            HostReading {
                memory_rss_bytes: Some(reads * 1024 * 1024),
                system_memory_used_percent: Some(42.0),
                system_memory_total_bytes: Some(4096 * 1024 * 1024),
                system_memory_free_bytes: Some(2376 * 1024 * 1024),
                cpu_count: Some(4),
                cpu_usage_percent: Some(12.3456),
                load_average: Some([0.5, 0.25, 0.125]),
            }
        }
    }

    fn rss(snapshots: &[Arc<Snapshot>]) -> Vec<f64> {
        snapshots.iter().map(|s| s.memory_rss_mb).collect()
    }

    struct Flaky {
        calls: AtomicUsize,
    }

    impl SnapshotProducer for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn latest(&self) -> Result<ExternalSnapshot, ProducerError> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(ExternalSnapshot::NowPlaying(NowPlaying::idle(1))),
                _ => Err(ProducerError::Unavailable("upstream down".into())),
            }
        }
    }

    struct Panics;

    impl SnapshotProducer for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        fn latest(&self) -> Result<ExternalSnapshot, ProducerError> {
            panic!("producer bug");
        }
    }

    struct Steady;

    impl SnapshotProducer for Steady {
        fn name(&self) -> &str {
            "steady"
        }

        fn latest(&self) -> Result<ExternalSnapshot, ProducerError> {
            Ok(ExternalSnapshot::TokenUsage(TokenUsage::empty()))
        }
    }

    #[test]
    fn latest_is_empty_before_the_first_tick() {
        let sampler = Sampler::builder(counting_probe()).build();
        let latest = sampler.latest();

        assert_eq!(latest.uptime_seconds, 0);
        assert_eq!(latest.memory_rss_mb, 0.0);
        assert!(sampler.history().is_empty());
    }

    #[test]
    fn sample_fills_every_field() {
        let counters = ConnectionCounters::new();
        let _sse = counters.open(ConnectionKind::Stream);
        let sampler = Sampler::builder(counting_probe())
            .counters(counters.clone())
            .app_version("9.9.9")
            .build();

        let snapshot = sampler.sample();
        assert_eq!(snapshot.app_version, "9.9.9");
        assert_eq!(snapshot.memory_rss_mb, 1.0);
        assert_eq!(snapshot.system_memory_used_percent, 42.0);
        assert_eq!(snapshot.system_memory_total_mb, 4096.0);
        assert_eq!(snapshot.system_memory_free_mb, 2376.0);
        assert_eq!(snapshot.cpu_count, 4);
        assert_eq!(snapshot.cpu_usage_percent, 12.35);
        assert_eq!(snapshot.load_average, [0.5, 0.25, 0.13]);
        assert_eq!(snapshot.pending_connections, 1);
        assert_eq!(sampler.latest(), snapshot);
    }

    #[test]
    fn missing_readings_become_zero() {
        let sampler = Sampler::builder(HostReading::default).build();
        let snapshot = sampler.sample();

        assert_eq!(snapshot.memory_rss_mb, 0.0);
        assert_eq!(snapshot.system_memory_free_mb, 0.0);
        assert_eq!(snapshot.cpu_count, 0);
        assert_eq!(snapshot.cpu_usage_percent, 0.0);
        assert_eq!(snapshot.load_average, [0.0; 3]);
    }

    #[test]
    fn history_keeps_the_newest_in_order() {
        let sampler = Sampler::builder(counting_probe()).history(3).build();
        for _ in 0..4 {
            sampler.sample();
        }

        assert_eq!(rss(&sampler.history()), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn subscriber_count_comes_from_the_relay() {
        let relay = Arc::new(Relay::default());
        let (_c1, s1) = cancel_pair();
        let (_c2, s2) = cancel_pair();
        let _a = relay.subscribe("cursors", SubscribeOptions::default(), s1);
        let _b = relay.subscribe("cursors", SubscribeOptions::default(), s2);

        let sampler = Sampler::builder(counting_probe())
            .relay(relay, "cursors")
            .build();
        assert_eq!(sampler.sample().subscriber_count, 2);
    }

    #[test]
    fn failing_producer_keeps_previous_value_and_others_still_report() {
        let sampler = Sampler::builder(counting_probe())
            .producer(Arc::new(Flaky {
                calls: AtomicUsize::new(0),
            }))
            .producer(Arc::new(Panics))
            .producer(Arc::new(Steady))
            .build();

        let first = sampler.sample();
        assert!(matches!(first.external("flaky"), Some(ExternalSnapshot::NowPlaying(_))));
        assert!(first.external("panics").is_none());
        assert!(first.external("steady").is_some());

        let second = sampler.sample();
        assert_eq!(second.external("flaky"), first.external("flaky"));
        assert!(second.external("steady").is_some());
        assert_eq!(second.memory_rss_mb, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_samples_immediately_then_every_interval() {
        let sampler = Arc::new(Sampler::builder(counting_probe()).build());

        assert!(sampler.start(Duration::from_millis(1500)));
        assert_eq!(sampler.history().len(), 1);

        tokio::time::sleep(Duration::from_millis(4600)).await;
        assert_eq!(rss(&sampler.history()), vec![1.0, 2.0, 3.0, 4.0]);

        assert!(sampler.stop());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sampler.history().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let sampler = Arc::new(Sampler::builder(counting_probe()).build());

        assert!(sampler.start(Duration::from_millis(1500)));
        assert!(!sampler.start(Duration::from_millis(1500)));
        assert!(!sampler.start(Duration::from_millis(100)));

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(sampler.history().len(), 3);
        assert!(sampler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn watchers_see_new_snapshots() {
        let sampler = Arc::new(Sampler::builder(counting_probe()).build());
        let mut updates = sampler.watch();

        sampler.start(Duration::from_millis(1500));
        updates.changed().await.unwrap();
        assert_eq!(updates.borrow_and_update().memory_rss_mb, 1.0);

        updates.changed().await.unwrap();
        assert_eq!(updates.borrow_and_update().memory_rss_mb, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn uptime_advances_with_the_clock() {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = ticks.clone();
        let sampler = Sampler::builder(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            HostReading::default()
        })
        .build();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(sampler.sample().uptime_seconds, 30);
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }
}

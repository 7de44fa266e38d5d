//! Snapshot - a point-in-time view of the server.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ExternalSnapshot;

/// A point-in-time metrics record.
///
/// Snapshots are produced by the sampler once per tick and never mutated
/// afterwards; consumers receive them over the snapshot stream or from the
/// history endpoint.
///
/// # Example
///
/// ```rust
/// use pulsewire_types::{ExternalSnapshot, Snapshot};
///
/// let snapshot = Snapshot::builder()
///     .timestamp(1_703_160_000_000)
///     .uptime_seconds(30)
///     .external("spotify", ExternalSnapshot::Unconfigured)
///     .build();
///
/// let json = serde_json::to_value(&snapshot).unwrap();
/// assert_eq!(json["uptimeSeconds"], 30);
/// assert_eq!(json["external"]["spotify"]["kind"], "unconfigured");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Unix timestamp in milliseconds when this snapshot was taken.
    pub timestamp: u64,

    /// Version of the server that produced the snapshot.
    pub app_version: String,

    /// Seconds since the sampler's process started.
    pub uptime_seconds: u64,

    /// Resident set size of the process, in MiB.
    pub memory_rss_mb: f64,

    /// Host memory in use, in percent (0-100).
    pub system_memory_used_percent: f64,

    /// Host physical memory, in MiB.
    pub system_memory_total_mb: f64,

    /// Host memory available to new allocations, in MiB.
    pub system_memory_free_mb: f64,

    /// Logical CPUs visible to the process.
    pub cpu_count: u64,

    /// Process CPU time over the last tick, normalised by core count (0-100).
    pub cpu_usage_percent: f64,

    /// 1, 5 and 15 minute host load averages.
    pub load_average: [f64; 3],

    /// Live snapshot-stream and position-channel connections.
    pub pending_connections: u64,

    /// Subscribers currently attached to the position topic.
    pub subscriber_count: u64,

    /// Fragments supplied by external producers, keyed by producer name.
    #[serde(default)]
    pub external: BTreeMap<String, ExternalSnapshot>,
}

impl Snapshot {
    /// The all-zero snapshot served before the first tick.
    pub fn empty() -> Self {
        Self::builder().build()
    }

    /// Create a builder for constructing snapshots.
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new()
    }

    /// Get the fragment contributed by a producer.
    pub fn external(&self, producer: &str) -> Option<&ExternalSnapshot> {
        self.external.get(producer)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Builder for constructing `Snapshot` instances.
///
/// Every gauge passes through a sanitiser on `build()`: non-finite or
/// negative readings become 0, percentages are clamped to 0-100 and
/// fractional values are rounded to two decimals.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    timestamp: Option<u64>,
    app_version: Option<String>,
    uptime_seconds: u64,
    memory_rss_mb: f64,
    system_memory_used_percent: f64,
    system_memory_total_mb: f64,
    system_memory_free_mb: f64,
    cpu_count: u64,
    cpu_usage_percent: f64,
    load_average: [f64; 3],
    pending_connections: u64,
    subscriber_count: u64,
    external: BTreeMap<String, ExternalSnapshot>,
}

impl SnapshotBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a specific timestamp (milliseconds since Unix epoch).
    pub fn timestamp(mut self, ts: u64) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    pub fn uptime_seconds(mut self, secs: u64) -> Self {
        self.uptime_seconds = secs;
        self
    }

    pub fn memory_rss_mb(mut self, mb: f64) -> Self {
        self.memory_rss_mb = mb;
        self
    }

    pub fn system_memory_used_percent(mut self, percent: f64) -> Self {
        self.system_memory_used_percent = percent;
        self
    }

    pub fn system_memory_total_mb(mut self, mb: f64) -> Self {
        self.system_memory_total_mb = mb;
        self
    }

    pub fn system_memory_free_mb(mut self, mb: f64) -> Self {
        self.system_memory_free_mb = mb;
        self
    }

    pub fn cpu_count(mut self, count: u64) -> Self {
        self.cpu_count = count;
        self
    }

    pub fn cpu_usage_percent(mut self, percent: f64) -> Self {
        self.cpu_usage_percent = percent;
        self
    }

    pub fn load_average(mut self, load: [f64; 3]) -> Self {
        self.load_average = load;
        self
    }

    pub fn pending_connections(mut self, count: u64) -> Self {
        self.pending_connections = count;
        self
    }

    pub fn subscriber_count(mut self, count: u64) -> Self {
        self.subscriber_count = count;
        self
    }

    /// Add the fragment for one producer, replacing any earlier one.
    pub fn external(mut self, producer: impl Into<String>, fragment: ExternalSnapshot) -> Self {
        self.external.insert(producer.into(), fragment);
        self
    }

    /// Build the snapshot.
    pub fn build(self) -> Snapshot {
        Snapshot {
            timestamp: self.timestamp.unwrap_or_else(current_timestamp_ms),
            app_version: self
                .app_version
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            uptime_seconds: self.uptime_seconds,
            memory_rss_mb: gauge(self.memory_rss_mb),
            system_memory_used_percent: percent(self.system_memory_used_percent),
            system_memory_total_mb: gauge(self.system_memory_total_mb),
            system_memory_free_mb: gauge(self.system_memory_free_mb),
            cpu_count: self.cpu_count,
            cpu_usage_percent: percent(self.cpu_usage_percent),
            load_average: self.load_average.map(gauge),
            pending_connections: self.pending_connections,
            subscriber_count: self.subscriber_count,
            external: self.external,
        }
    }
}

/// Non-negative, finite, two decimals.
fn gauge(value: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    (value * 100.0).round() / 100.0
}

fn percent(value: f64) -> f64 {
    gauge(value).min(100.0)
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NowPlaying;

    #[test]
    fn empty_snapshot_is_all_zero() {
        let snapshot = Snapshot::empty();

        assert_eq!(snapshot.uptime_seconds, 0);
        assert_eq!(snapshot.memory_rss_mb, 0.0);
        assert_eq!(snapshot.system_memory_total_mb, 0.0);
        assert_eq!(snapshot.cpu_count, 0);
        assert_eq!(snapshot.cpu_usage_percent, 0.0);
        assert_eq!(snapshot.load_average, [0.0, 0.0, 0.0]);
        assert_eq!(snapshot.pending_connections, 0);
        assert_eq!(snapshot.subscriber_count, 0);
        assert!(snapshot.external.is_empty());
        assert!(snapshot.timestamp > 0);
    }

    #[test]
    fn builder_sanitises_gauges() {
        let snapshot = Snapshot::builder()
            .memory_rss_mb(f64::NAN)
            .system_memory_used_percent(180.0)
            .system_memory_free_mb(-1.0)
            .cpu_usage_percent(-3.0)
            .load_average([0.456, f64::INFINITY, -1.0])
            .build();

        assert_eq!(snapshot.memory_rss_mb, 0.0);
        assert_eq!(snapshot.system_memory_used_percent, 100.0);
        assert_eq!(snapshot.system_memory_free_mb, 0.0);
        assert_eq!(snapshot.cpu_usage_percent, 0.0);
        assert_eq!(snapshot.load_average, [0.46, 0.0, 0.0]);
    }

    #[test]
    fn serializes_camel_case() {
        let snapshot = Snapshot::builder()
            .timestamp(1_703_160_000_000)
            .app_version("1.2.3")
            .memory_rss_mb(12.5)
            .system_memory_total_mb(16384.0)
            .system_memory_free_mb(2048.126)
            .cpu_count(8)
            .pending_connections(3)
            .subscriber_count(2)
            .external("spotify", ExternalSnapshot::NowPlaying(NowPlaying::idle(7)))
            .build();

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["timestamp"], 1_703_160_000_000u64);
        assert_eq!(json["appVersion"], "1.2.3");
        assert_eq!(json["memoryRssMb"], 12.5);
        assert_eq!(json["systemMemoryTotalMb"], 16384.0);
        assert_eq!(json["systemMemoryFreeMb"], 2048.13);
        assert_eq!(json["cpuCount"], 8);
        assert_eq!(json["pendingConnections"], 3);
        assert_eq!(json["subscriberCount"], 2);
        assert_eq!(json["external"]["spotify"]["kind"], "nowPlaying");
        assert_eq!(json["external"]["spotify"]["isPlaying"], false);
    }

    #[test]
    fn serde_roundtrip() {
        let snapshot = Snapshot::builder()
            .timestamp(1_703_160_000_000)
            .uptime_seconds(99)
            .external("github", ExternalSnapshot::Unconfigured)
            .build();

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: Snapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(snapshot, parsed);
    }
}

//! Prometheus text exposition of the latest snapshot.
//!
//! ```rust
//! use pulsewire_sdk::prometheus::format_prometheus;
//! use pulsewire_types::Snapshot;
//!
//! let snapshot = Snapshot::builder().timestamp(1_000).subscriber_count(3).build();
//! let text = format_prometheus(&snapshot, Some("pulsewire"));
//! assert!(text.contains("pulsewire_subscribers 3\n"));
//! ```

use std::fmt::Write;

use pulsewire_types::Snapshot;

/// Content type for the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Format a snapshot as Prometheus exposition text.
pub fn format_prometheus(snapshot: &Snapshot, namespace: Option<&str>) -> String {
    let prefix = namespace.map(|n| format!("{}_", n)).unwrap_or_default();
    let mut out = String::new();

    let gauges: [(&str, &str, f64); 10] = [
        ("uptime_seconds", "Seconds since the server started", snapshot.uptime_seconds as f64),
        ("memory_rss_megabytes", "Resident set size of the server process", snapshot.memory_rss_mb),
        (
            "system_memory_used_percent",
            "Host memory in use",
            snapshot.system_memory_used_percent,
        ),
        (
            "system_memory_total_megabytes",
            "Host physical memory",
            snapshot.system_memory_total_mb,
        ),
        (
            "system_memory_free_megabytes",
            "Host memory available",
            snapshot.system_memory_free_mb,
        ),
        ("cpu_count", "Logical CPUs", snapshot.cpu_count as f64),
        ("cpu_usage_percent", "Process CPU normalised by core count", snapshot.cpu_usage_percent),
        (
            "connections",
            "Open snapshot stream and position channel connections",
            snapshot.pending_connections as f64,
        ),
        ("subscribers", "Subscribers on the position topic", snapshot.subscriber_count as f64),
        (
            "snapshot_timestamp_seconds",
            "Unix timestamp of the snapshot",
            snapshot.timestamp as f64 / 1000.0,
        ),
    ];

    for (name, help, value) in gauges {
        header(&mut out, &prefix, name, help);
        let _ = writeln!(out, "{}{} {}", prefix, name, value);
    }

    header(&mut out, &prefix, "load_average", "Host load average");
    for (window, value) in ["1m", "5m", "15m"].iter().zip(snapshot.load_average) {
        let _ = writeln!(out, "{}load_average{{window=\"{}\"}} {}", prefix, window, value);
    }

    if !snapshot.external.is_empty() {
        header(
            &mut out,
            &prefix,
            "producer_configured",
            "Whether an external producer has a source configured",
        );
        for (name, fragment) in &snapshot.external {
            let _ = writeln!(
                out,
                "{}producer_configured{{producer=\"{}\"}} {}",
                prefix,
                escape_label_value(name),
                u8::from(fragment.is_configured())
            );
        }
    }

    let _ = writeln!(
        out,
        "{}build_info{{version=\"{}\"}} 1",
        prefix,
        escape_label_value(&snapshot.app_version)
    );

    out
}

fn header(out: &mut String, prefix: &str, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {}{} {}", prefix, name, help);
    let _ = writeln!(out, "# TYPE {}{} gauge", prefix, name);
}

/// Escape a label value for Prometheus format.
/// Backslash, double-quote, and newline must be escaped.
fn escape_label_value(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

//! Fragments contributed to a snapshot by external producers.

use serde::{Deserialize, Serialize};

/// What one external producer contributes to a snapshot.
///
/// Serialized with a `kind` tag so consumers can tell "not configured"
/// apart from "configured but nothing to report".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ExternalSnapshot {
    /// The producer has no credentials or source configured.
    Unconfigured,
    NowPlaying(NowPlaying),
    CommitStats(CommitStats),
    TokenUsage(TokenUsage),
}

impl ExternalSnapshot {
    pub fn is_configured(&self) -> bool {
        !matches!(self, ExternalSnapshot::Unconfigured)
    }
}

/// Currently playing track from a music service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NowPlaying {
    pub is_playing: bool,
    pub track_id: Option<String>,
    pub track_name: Option<String>,
    pub artist_names: Vec<String>,
    pub album_name: Option<String>,
    pub track_url: Option<String>,
    pub progress_ms: u64,
    pub duration_ms: u64,
    /// Unix ms of the poll that produced this value.
    pub fetched_at: u64,
}

impl NowPlaying {
    /// Configured, but nothing is playing.
    pub fn idle(fetched_at: u64) -> Self {
        Self {
            is_playing: false,
            track_id: None,
            track_name: None,
            artist_names: Vec::new(),
            album_name: None,
            track_url: None,
            progress_ms: 0,
            duration_ms: 0,
            fetched_at,
        }
    }
}

/// Commit activity for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitStats {
    pub username: String,
    pub year: i32,
    pub commits_year_to_date: u64,
    /// Oldest day first; always seven entries.
    pub commits_last_7_days: Vec<u64>,
    /// `MM/DD` labels matching `commits_last_7_days`.
    pub commits_last_7_day_labels: Vec<String>,
    pub fetched_at: u64,
}

impl CommitStats {
    /// Zeroed stats, used before the first successful poll and after failures.
    pub fn zeroed(username: impl Into<String>, year: i32, fetched_at: u64) -> Self {
        Self {
            username: username.into(),
            year,
            commits_year_to_date: 0,
            commits_last_7_days: vec![0; 7],
            commits_last_7_day_labels: vec!["--/--".to_string(); 7],
            fetched_at,
        }
    }
}

/// Token usage reported by a local sync job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Unix ms at which the sync job generated the data.
    pub generated_at: Option<u64>,
    pub is_stale: bool,
    pub latest_day: Option<UsageDay>,
    pub totals: Option<UsageTotals>,
    pub daily: Vec<UsageTotals>,
}

impl TokenUsage {
    pub fn empty() -> Self {
        Self {
            generated_at: None,
            is_stale: true,
            latest_day: None,
            totals: None,
            daily: Vec::new(),
        }
    }
}

/// Token counters for a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageDay {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub total_tokens: u64,
}

/// File format written by the usage sync job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSyncPayload {
    pub generated_at: u64,
    pub daily: Vec<UsageDay>,
    #[serde(default)]
    pub totals: Option<UsageTotals>,
}

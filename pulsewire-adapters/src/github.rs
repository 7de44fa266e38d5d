//! GitHub commit activity via the commit search API.
//!
//! Reports the year-to-date commit count and the last seven daily counts for
//! one account. Eight search queries are issued per refresh, so the poll
//! interval is long (30 minutes) and rate-limit responses are honoured.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pulsewire_adapters::github::GitHubProducer;
//! use pulsewire_sdk::{cancel_pair, spawn_poller};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let github = Arc::new(
//!         GitHubProducer::builder()
//!             .username("octocat")
//!             .token(std::env::var("GITHUB_TOKEN").ok())
//!             .build()?,
//!     );
//!
//!     let (_stop, signal) = cancel_pair();
//!     spawn_poller(github.clone(), GitHubProducer::policy(), signal);
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate, TimeDelta};
use futures_util::future::try_join_all;
use pulsewire_sdk::{
    LatestValue, PollOutcome, PollPolicy, Poller, ProducerError, SnapshotProducer,
};
use pulsewire_types::{current_timestamp_ms, CommitStats, ExternalSnapshot};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::AdapterError;

const DEFAULT_ENDPOINT: &str = "https://api.github.com";
const POLL_INTERVAL: Duration = Duration::from_secs(30 * 60);
const RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(15 * 60);

/// Commit stats producer for a single GitHub account.
#[derive(Debug)]
pub struct GitHubProducer {
    client: Client,
    endpoint: String,
    username: Option<String>,
    token: Option<String>,
    value: LatestValue,
}

impl GitHubProducer {
    /// Create a new builder for configuring the producer.
    pub fn builder() -> GitHubProducerBuilder {
        GitHubProducerBuilder::default()
    }

    /// 30 minutes between refreshes, 15 minutes after a failure or an
    /// unexplained rate limit.
    pub fn policy() -> PollPolicy {
        PollPolicy::fixed(POLL_INTERVAL)
            .with_rate_limit_fallback(RATE_LIMIT_FALLBACK)
            .with_failure_backoff(RATE_LIMIT_FALLBACK)
            .with_max_delay(Duration::from_secs(2 * 60 * 60))
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }

    /// Fetch fresh stats for the configured account.
    pub async fn fetch(&self) -> Result<CommitStats, AdapterError> {
        let username = self.username.as_deref().ok_or(AdapterError::NotConfigured)?;
        let today = Local::now().date_naive();
        let window = CommitWindow::ending(today);

        let mut queries = vec![self.count(username, window.year_start, today)];
        for day in window.days {
            queries.push(self.count(username, day, day));
        }
        let mut counts = try_join_all(queries).await?;
        let year_to_date = counts.remove(0);

        Ok(CommitStats {
            username: username.to_string(),
            year: today.year(),
            commits_year_to_date: year_to_date,
            commits_last_7_days: counts,
            commits_last_7_day_labels: window.labels(),
            fetched_at: current_timestamp_ms(),
        })
    }

    async fn count(&self, username: &str, from: NaiveDate, to: NaiveDate) -> Result<u64, AdapterError> {
        let url = format!("{}/search/commits", self.endpoint);
        let query = format!("author:{} author-date:{}..{}", username, from, to);

        let mut request = self
            .client
            .get(&url)
            .query(&[("q", query.as_str()), ("per_page", "1")])
            .header(ACCEPT, "application/vnd.github.cloak-preview+json");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN && rate_limit_exhausted(response.headers()))
        {
            let retry_after = reset_delay(response.headers(), current_timestamp_ms() / 1000);
            return Err(AdapterError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Http(format!(
                "commit search returned status {}: {}",
                status, body
            )));
        }

        let payload: SearchResponse = response.json().await?;
        Ok(payload.total_count.unwrap_or(0))
    }
}

impl SnapshotProducer for GitHubProducer {
    fn name(&self) -> &str {
        "github"
    }

    fn latest(&self) -> Result<ExternalSnapshot, ProducerError> {
        Ok(self.value.get())
    }
}

#[async_trait]
impl Poller for GitHubProducer {
    fn name(&self) -> &str {
        "github"
    }

    async fn poll(&self) -> PollOutcome {
        let Some(username) = self.username.as_deref() else {
            self.value.set(ExternalSnapshot::Unconfigured);
            return PollOutcome::Idle;
        };

        match self.fetch().await {
            Ok(stats) => {
                debug!(username, ytd = stats.commits_year_to_date, "commit stats refreshed");
                self.value.set(ExternalSnapshot::CommitStats(stats));
                PollOutcome::Active
            }
            Err(AdapterError::RateLimited { retry_after }) => PollOutcome::RateLimited { retry_after },
            Err(error) => {
                warn!(username, %error, "failed to refresh commit stats");
                let year = Local::now().year();
                self.value.set(ExternalSnapshot::CommitStats(CommitStats::zeroed(
                    username,
                    year,
                    current_timestamp_ms(),
                )));
                PollOutcome::Failed
            }
        }
    }
}

/// The eight date ranges queried on each refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CommitWindow {
    year_start: NaiveDate,
    /// Oldest first, ending today.
    days: [NaiveDate; 7],
}

impl CommitWindow {
    fn ending(today: NaiveDate) -> Self {
        let year_start = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today);
        let days = std::array::from_fn(|i| today - TimeDelta::days(6 - i as i64));
        Self { year_start, days }
    }

    fn labels(&self) -> Vec<String> {
        self.days
            .iter()
            .map(|d| d.format("%m/%d").to_string())
            .collect()
    }
}

fn rate_limit_exhausted(headers: &HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0")
}

/// Time until `x-ratelimit-reset` (Unix seconds), plus one second of slack.
fn reset_delay(headers: &HeaderMap, now_secs: u64) -> Option<Duration> {
    let reset: u64 = headers
        .get("x-ratelimit-reset")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    (reset > now_secs).then(|| Duration::from_secs(reset - now_secs + 1))
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    total_count: Option<u64>,
}

/// Builder for GitHubProducer.
#[derive(Debug, Default)]
pub struct GitHubProducerBuilder {
    endpoint: Option<String>,
    username: Option<String>,
    token: Option<String>,
    user_agent: Option<String>,
    timeout: Option<Duration>,
}

impl GitHubProducerBuilder {
    /// Set the API base URL (default: "https://api.github.com").
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Account whose commits are counted. Blank means unconfigured.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        let username = username.into();
        let username = username.trim();
        self.username = (!username.is_empty()).then(|| username.to_string());
        self
    }

    /// Optional personal access token; raises the search rate limit.
    pub fn token(mut self, token: Option<String>) -> Self {
        self.token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the request timeout (default: 10 seconds).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the producer.
    pub fn build(self) -> Result<GitHubProducer, AdapterError> {
        let client = Client::builder()
            .timeout(self.timeout.unwrap_or(Duration::from_secs(10)))
            .default_headers({
                let mut headers = HeaderMap::new();
                let agent = self
                    .user_agent
                    .unwrap_or_else(|| format!("pulsewire/{}", env!("CARGO_PKG_VERSION")));
                if let Ok(value) = agent.parse() {
                    headers.insert(USER_AGENT, value);
                }
                headers
            })
            .build()?;

        let value = LatestValue::new(match &self.username {
            Some(username) => ExternalSnapshot::CommitStats(CommitStats::zeroed(
                username.clone(),
                Local::now().year(),
                current_timestamp_ms(),
            )),
            None => ExternalSnapshot::Unconfigured,
        });

        Ok(GitHubProducer {
            client,
            endpoint: self
                .endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            username: self.username,
            token: self.token,
            value,
        })
    }
}

//! Spotify "currently playing" via the Web API.
//!
//! Uses the refresh-token flow: a long-lived refresh token plus client
//! credentials are exchanged for a short-lived access token, cached until a
//! minute before it expires. Polls fast while something is playing and slow
//! otherwise.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use pulsewire_sdk::{
    LatestValue, PollOutcome, PollPolicy, Poller, ProducerError, SnapshotProducer,
};
use pulsewire_types::{current_timestamp_ms, ExternalSnapshot, NowPlaying};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::AdapterError;

const DEFAULT_ACCOUNTS_ENDPOINT: &str = "https://accounts.spotify.com";
const DEFAULT_API_ENDPOINT: &str = "https://api.spotify.com";
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Client credentials and refresh token for one Spotify account.
#[derive(Clone)]
pub struct SpotifyCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl SpotifyCredentials {
    /// All three values, or `None` if any is missing or blank.
    pub fn from_parts(
        client_id: Option<String>,
        client_secret: Option<String>,
        refresh_token: Option<String>,
    ) -> Option<Self> {
        let present = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Some(Self {
            client_id: present(client_id)?,
            client_secret: present(client_secret)?,
            refresh_token: present(refresh_token)?,
        })
    }
}

impl std::fmt::Debug for SpotifyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotifyCredentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Now-playing producer.
#[derive(Debug)]
pub struct SpotifyProducer {
    client: Client,
    accounts_endpoint: String,
    api_endpoint: String,
    credentials: Option<SpotifyCredentials>,
    token: Mutex<Option<CachedToken>>,
    value: LatestValue,
}

impl SpotifyProducer {
    /// Create a new builder for configuring the producer.
    pub fn builder() -> SpotifyProducerBuilder {
        SpotifyProducerBuilder::default()
    }

    /// 2.5s while playing, 15s when idle or after a failure, 30s after an
    /// unexplained rate limit.
    pub fn policy() -> PollPolicy {
        PollPolicy::fixed(Duration::from_millis(2500))
            .with_idle_interval(Duration::from_secs(15))
            .with_rate_limit_fallback(Duration::from_secs(30))
            .with_failure_backoff(Duration::from_secs(15))
            .with_max_delay(Duration::from_secs(10 * 60))
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    async fn access_token(&self, credentials: &SpotifyCredentials) -> Result<String, AdapterError> {
        let cached = self.token.lock().clone();
        if let Some(cached) = cached {
            if cached.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                return Ok(cached.access_token);
            }
        }

        let response = self
            .client
            .post(format!("{}/api/token", self.accounts_endpoint))
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", credentials.refresh_token.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Auth(format!(
                "token refresh returned status {}: {}",
                status, body
            )));
        }

        let payload: TokenResponse = response.json().await?;
        let token = CachedToken {
            access_token: payload.access_token,
            expires_at: expiry_after(payload.expires_in),
        };
        let access_token = token.access_token.clone();
        *self.token.lock() = Some(token);
        debug!("spotify access token refreshed");
        Ok(access_token)
    }

    /// Fetch the currently playing track.
    pub async fn fetch(&self) -> Result<NowPlaying, AdapterError> {
        let credentials = self.credentials.as_ref().ok_or(AdapterError::NotConfigured)?;
        let token = self.access_token(credentials).await?;

        let response = self
            .client
            .get(format!("{}/v1/me/player/currently-playing", self.api_endpoint))
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => return Ok(NowPlaying::idle(current_timestamp_ms())),
            StatusCode::UNAUTHORIZED => {
                self.token.lock().take();
                return Err(AdapterError::Auth("access token rejected".to_string()));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                return Err(AdapterError::RateLimited { retry_after });
            }
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(AdapterError::Http(format!(
                    "currently-playing returned status {}: {}",
                    status, body
                )));
            }
            _ => {}
        }

        let payload: CurrentlyPlaying = response.json().await?;
        Ok(payload.into_now_playing(current_timestamp_ms()))
    }
}

impl SnapshotProducer for SpotifyProducer {
    fn name(&self) -> &str {
        "spotify"
    }

    fn latest(&self) -> Result<ExternalSnapshot, ProducerError> {
        Ok(self.value.get())
    }
}

#[async_trait]
impl Poller for SpotifyProducer {
    fn name(&self) -> &str {
        "spotify"
    }

    async fn poll(&self) -> PollOutcome {
        if !self.is_configured() {
            self.value.set(ExternalSnapshot::Unconfigured);
            return PollOutcome::Idle;
        }

        match self.fetch().await {
            Ok(now_playing) => {
                let playing = now_playing.is_playing;
                self.value.set(ExternalSnapshot::NowPlaying(now_playing));
                if playing {
                    PollOutcome::Active
                } else {
                    PollOutcome::Idle
                }
            }
            Err(AdapterError::RateLimited { retry_after }) => PollOutcome::RateLimited { retry_after },
            Err(error) => {
                warn!(%error, "failed to refresh now playing");
                self.value
                    .set(ExternalSnapshot::NowPlaying(NowPlaying::idle(current_timestamp_ms())));
                PollOutcome::Failed
            }
        }
    }
}

/// Whole seconds from a `Retry-After` header; zero or garbage is ignored.
/// When a token issued now with a lifetime of `expires_in` seconds expires.
/// A lifetime too large to represent counts as already expired.
fn expiry_after(expires_in: u64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_secs(expires_in))
        .unwrap_or(now)
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: u64 = value.trim().parse().ok()?;
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct CurrentlyPlaying {
    #[serde(default)]
    is_playing: bool,
    progress_ms: Option<u64>,
    #[serde(default)]
    currently_playing_type: String,
    item: Option<Track>,
}

#[derive(Debug, Deserialize)]
struct Track {
    id: Option<String>,
    name: String,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    artists: Vec<Artist>,
    album: Option<Album>,
    #[serde(default)]
    external_urls: ExternalUrls,
}

#[derive(Debug, Deserialize)]
struct Artist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Album {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ExternalUrls {
    spotify: Option<String>,
}

impl CurrentlyPlaying {
    /// Podcasts, ads and empty players all read as "nothing playing".
    fn into_now_playing(self, fetched_at: u64) -> NowPlaying {
        let track = match self.item {
            Some(track) if self.currently_playing_type == "track" => track,
            _ => return NowPlaying::idle(fetched_at),
        };

        NowPlaying {
            is_playing: self.is_playing,
            track_id: track.id,
            track_name: Some(track.name),
            artist_names: track.artists.into_iter().map(|a| a.name).collect(),
            album_name: track.album.map(|a| a.name),
            track_url: track.external_urls.spotify,
            progress_ms: self.progress_ms.unwrap_or(0),
            duration_ms: track.duration_ms,
            fetched_at,
        }
    }
}

/// Builder for SpotifyProducer.
#[derive(Debug, Default)]
pub struct SpotifyProducerBuilder {
    accounts_endpoint: Option<String>,
    api_endpoint: Option<String>,
    credentials: Option<SpotifyCredentials>,
    timeout: Option<Duration>,
}

impl SpotifyProducerBuilder {
    /// Set the credentials. Without them the producer reports unconfigured.
    pub fn credentials(mut self, credentials: Option<SpotifyCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the accounts service base URL (default: "https://accounts.spotify.com").
    pub fn accounts_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.accounts_endpoint = Some(endpoint.into());
        self
    }

    /// Set the Web API base URL (default: "https://api.spotify.com").
    pub fn api_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.api_endpoint = Some(endpoint.into());
        self
    }

    /// Set the request timeout (default: 10 seconds).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the producer.
    pub fn build(self) -> Result<SpotifyProducer, AdapterError> {
        let client = Client::builder()
            .timeout(self.timeout.unwrap_or(Duration::from_secs(10)))
            .build()?;

        let value = LatestValue::new(match self.credentials {
            Some(_) => ExternalSnapshot::NowPlaying(NowPlaying::idle(current_timestamp_ms())),
            None => ExternalSnapshot::Unconfigured,
        });

        let trim = |s: String| s.trim_end_matches('/').to_string();
        Ok(SpotifyProducer {
            client,
            accounts_endpoint: trim(
                self.accounts_endpoint
                    .unwrap_or_else(|| DEFAULT_ACCOUNTS_ENDPOINT.to_string()),
            ),
            api_endpoint: trim(
                self.api_endpoint
                    .unwrap_or_else(|| DEFAULT_API_ENDPOINT.to_string()),
            ),
            credentials: self.credentials,
            token: Mutex::new(None),
            value,
        })
    }
}

//! Server configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `PULSEWIRE_*` environment variables using `__` between sections
//! (`PULSEWIRE_SAMPLER__INTERVAL_MS=1000`). A bare `PORT` variable replaces
//! the port of `server.bind`. Everything has a default, so the server runs
//! with no configuration at all.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use pulsewire_sdk::RelayConfig;
use serde::Deserialize;

const ENV_PREFIX: &str = "PULSEWIRE";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub sampler: SamplerSettings,
    pub relay: RelaySettings,
    pub identity: IdentitySettings,
    pub usage: UsageSettings,
    pub github: GitHubSettings,
    pub spotify: SpotifySettings,
    pub log: LogSettings,
}

impl Settings {
    /// Load settings from defaults, `path` (if any) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = Self::load_from(path, None)?;
        if let Ok(port) = std::env::var("PORT") {
            settings.apply_port(&port)?;
        }
        Ok(settings)
    }

    /// Like [`Settings::load`], but reads variables from `env` instead of the
    /// process environment when given.
    pub fn load_from(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config = builder.build().context("failed to read configuration")?;
        config
            .try_deserialize()
            .context("invalid configuration")
    }

    /// Replace the bind port, keeping the bind address.
    pub fn apply_port(&mut self, port: &str) -> Result<()> {
        let port: u16 = port
            .trim()
            .parse()
            .with_context(|| format!("PORT is not a valid port number: {:?}", port))?;
        self.server.bind.set_port(port);
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3000)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    pub interval_ms: u64,
    pub history: usize,
}

impl SamplerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1500,
            history: pulsewire_sdk::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub topic: String,
    pub resume: bool,
    pub retention_secs: u64,
    pub resume_capacity: usize,
    pub subscriber_buffer: usize,
    pub echo: bool,
    pub sweep_interval_secs: u64,
}

impl RelaySettings {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            resume: self.resume,
            retention: Duration::from_secs(self.retention_secs),
            resume_capacity: self.resume_capacity.max(1),
            subscriber_buffer: self.subscriber_buffer.max(1),
            echo: self.echo,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            topic: "cursors".to_string(),
            resume: relay.resume,
            retention_secs: relay.retention.as_secs(),
            resume_capacity: relay.resume_capacity,
            subscriber_buffer: relay.subscriber_buffer,
            echo: relay.echo,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub cookie_name: String,
    pub max_age_days: u64,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            cookie_name: "pulsewire_sid".to_string(),
            max_age_days: 365,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageSettings {
    pub file: PathBuf,
    pub stale_after_minutes: u64,
    pub refresh_secs: u64,
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self {
            file: PathBuf::from("runtime/usage.json"),
            stale_after_minutes: 180,
            refresh_secs: 30,
        }
    }
}

/// GitHub producer settings; without a username the producer reports
/// unconfigured.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GitHubSettings {
    pub username: Option<String>,
    pub token: Option<String>,
}

/// Spotify producer settings; all three values are required.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SpotifySettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub filter: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

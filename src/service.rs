//! Wires settings into a running sampler, relay and producer set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pulsewire_adapters::github::GitHubProducer;
use pulsewire_adapters::spotify::{SpotifyCredentials, SpotifyProducer};
use pulsewire_adapters::usage::UsageFileProducer;
use pulsewire_sdk::{
    spawn_poller, CancelSignal, HostProbe, Relay, Sampler, SnapshotProducer, SystemProbe,
};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Settings;
use crate::gateway::{AppState, Identity};

/// Everything behind the gateway, running.
pub struct Service {
    state: AppState,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Build and start all background work with the host probe.
    ///
    /// Must be called from within a tokio runtime. Pollers and the resume
    /// sweeper stop when `shutdown` fires; call [`Service::stop`] to also stop
    /// the sampler and wait for them.
    pub fn start(settings: &Settings, shutdown: CancelSignal) -> Result<Self> {
        Self::start_with_probe(settings, shutdown, SystemProbe::new())
    }

    /// Like [`Service::start`] with a caller-supplied probe.
    pub fn start_with_probe(
        settings: &Settings,
        shutdown: CancelSignal,
        probe: impl HostProbe + 'static,
    ) -> Result<Self> {
        let relay = Arc::new(Relay::new(settings.relay.relay_config()));
        let topic = settings.relay.topic.as_str();
        let mut tasks =
            vec![relay.spawn_sweeper(settings.relay.sweep_interval(), shutdown.clone())];

        let github = Arc::new(github_producer(settings)?);
        let spotify = Arc::new(spotify_producer(settings)?);
        let usage = Arc::new(usage_producer(settings));

        tasks.push(spawn_poller(github.clone(), GitHubProducer::policy(), shutdown.clone()));
        tasks.push(spawn_poller(spotify.clone(), SpotifyProducer::policy(), shutdown.clone()));
        tasks.push(spawn_poller(usage.clone(), usage.policy(), shutdown.clone()));

        for (name, configured) in [
            ("github", github.is_configured()),
            ("spotify", spotify.is_configured()),
        ] {
            if !configured {
                debug!(producer = name, "producer not configured");
            }
        }

        let producers: [Arc<dyn SnapshotProducer>; 3] = [github, spotify, usage];
        let sampler = producers
            .into_iter()
            .fold(Sampler::builder(probe), |builder, producer| builder.producer(producer))
            .relay(relay.clone(), topic)
            .app_version(env!("CARGO_PKG_VERSION"))
            .history(settings.sampler.history)
            .build();
        let sampler = Arc::new(sampler);
        sampler.start(settings.sampler.interval());

        info!(
            interval = ?settings.sampler.interval(),
            history = settings.sampler.history,
            topic,
            resume = settings.relay.resume,
            "Service started"
        );

        Ok(Self {
            state: AppState {
                sampler,
                relay,
                topic: Arc::from(topic),
                identity: Arc::new(Identity::new(&settings.identity)),
                shutdown,
            },
            tasks,
        })
    }

    /// Handler state for the gateway.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Stop the sampler and every background task.
    pub async fn stop(self) {
        self.state.sampler.stop();
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Service stopped");
    }
}

fn github_producer(settings: &Settings) -> Result<GitHubProducer> {
    let mut builder = GitHubProducer::builder().token(settings.github.token.clone());
    if let Some(username) = &settings.github.username {
        builder = builder.username(username.as_str());
    }
    builder.build().context("failed to build GitHub producer")
}

fn spotify_producer(settings: &Settings) -> Result<SpotifyProducer> {
    let spotify = &settings.spotify;
    SpotifyProducer::builder()
        .credentials(SpotifyCredentials::from_parts(
            spotify.client_id.clone(),
            spotify.client_secret.clone(),
            spotify.refresh_token.clone(),
        ))
        .build()
        .context("failed to build Spotify producer")
}

fn usage_producer(settings: &Settings) -> UsageFileProducer {
    UsageFileProducer::builder()
        .path(settings.usage.file.clone())
        .stale_after(Duration::from_secs(settings.usage.stale_after_minutes * 60))
        .refresh(Duration::from_secs(settings.usage.refresh_secs.max(1)))
        .build()
}

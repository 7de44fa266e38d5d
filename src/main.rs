use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pulsewire::{gateway, Service, Settings};
use pulsewire_sdk::cancel_pair;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pulsewire")]
#[command(version)]
#[command(about = "Realtime telemetry relay: host snapshots over SSE, cursor positions over WebSocket")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides server.bind and PORT)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "pulsewire=debug" (overrides RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings =
        Settings::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(bind) = args.bind {
        settings.server.bind = bind;
    }

    init_tracing(args.log.as_deref(), &settings.log.filter);

    let listener = TcpListener::bind(settings.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", settings.server.bind))?;

    let (stop, shutdown) = cancel_pair();
    let service = Service::start(&settings, shutdown)?;

    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl-C, shutting down");
        stop.cancel();
    });

    let served = gateway::serve(listener, service.state()).await;
    service.stop().await;
    served
}

/// `--log` wins, then `RUST_LOG`, then the configured filter.
fn init_tracing(cli: Option<&str>, configured: &str) {
    let filter = match cli {
        Some(directives) => EnvFilter::try_new(directives).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .or_else(|| EnvFilter::try_new(configured).ok())
    .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

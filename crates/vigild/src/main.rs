//! vigild — health-checking control plane for network load balancers.
//!
//! Probes fleets of real servers grouped under virtual services, keeps the
//! load balancer's real-server state in sync with the probe results, and
//! raises or withdraws the services' route announcements based on
//! per-prefix quorum.

mod app;
mod config;
mod server;

use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::config::{AppConfig, LogFormat, LoggingConfig};

/// Health-checking control plane daemon.
#[derive(FromArgs)]
struct Args {
    /// path to the daemon configuration file
    #[argh(option, short = 'c')]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    let config = AppConfig::load(&args.config)?;
    init_tracing(&config.logging);
    info!(config = %args.config.display(), "starting vigild");

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let app = App::new(config).context("failed to initialize")?;
    app.run(shutdown).await
}

fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match config.format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Cancels the token on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install signal handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
        shutdown.cancel();
    });
    Ok(())
}

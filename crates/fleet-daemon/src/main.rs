//! fleetd — the fleet coordination daemon.
//!
//! Loads the fleet config, builds the coordination service, optionally
//! connects to every registered target, and serves the HTTP API until
//! ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use fleet_control::CoordinationService;
use fleet_core::config::Config;

mod api;
mod logging;

#[derive(Debug, Parser)]
#[command(name = "fleetd", about = "Fleet admin-command coordination daemon")]
struct Cli {
    /// Path to the fleet configuration document.
    #[arg(long, default_value = "fleet-config.json")]
    config: PathBuf,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the listen port from the config.
    #[arg(long)]
    port: Option<u16>,

    /// Skip connecting to targets at startup.
    #[arg(long)]
    no_autoconnect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging("fleetd", &cli.log_level);

    let (mut config, unresolved) = Config::load_from(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    for var in &unresolved {
        warn!(var = %var, "environment variable not set, reference kept verbatim");
    }
    if let Some(port) = cli.port {
        config.daemon.port = port;
    }
    let addr = format!("{}:{}", config.daemon.host, config.daemon.port);

    info!(
        targets = config.targets.len(),
        groups = config.groups.len(),
        "fleetd starting"
    );

    let service = Arc::new(
        CoordinationService::new(config)
            .await
            .context("failed to build coordination service")?,
    );

    if cli.no_autoconnect {
        info!("autoconnect disabled, targets connect on first dispatch");
    } else {
        let connected = service.connect_all().await;
        info!(connected, "startup connect pass finished");
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "API server listening");

    let app = api::router(service.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    service.shutdown().await;
    info!("fleetd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    info!("ctrl-c received, shutting down");
}

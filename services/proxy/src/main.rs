//! skproxy
//!
//! Transparent TCP reverse proxy with kernel socket dispatch.
//!
//! This service:
//! - Reads the app routing table from a JSON file
//! - Probes each app's backends and binds its first port
//! - Attaches the sk_lookup dispatcher so the app's other ports reach the same
//!   listener
//! - Applies routing file changes without touching unchanged apps
//! - Unpins every kernel object on SIGINT or SIGTERM

use anyhow::{Context, Result};
use skp_config::ConfigStore;
use skp_dispatch::{AyaLoader, DispatchManager};
use skp_proxy::{Orchestrator, RoutingTable};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SKPROXY_LOG_LEVEL)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init(),
    }

    info!("Starting skproxy");
    info!(
        config_path = %config.config_path.display(),
        bind_ip = %config.bind_ip,
        dispatch_enabled = config.dispatch_enabled,
        pin_root = %config.pin_root.display(),
        watch = config.watch,
        "Configuration loaded"
    );

    let mut store = ConfigStore::new(&config.config_path);
    let routing = store
        .read()
        .with_context(|| format!("Invalid routing file {}", config.config_path.display()))?;
    info!(apps = routing.apps.len(), "Routing table loaded");

    let dispatch = config
        .dispatch()
        .map(|dispatch_config| DispatchManager::new(AyaLoader::new(), dispatch_config));
    let orchestrator = Orchestrator::new(config.orchestrator(), dispatch);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let table = RoutingTable::from(&routing);
    let orchestrator_handle = if config.watch {
        let updates = store.start_watcher()?;
        tokio::spawn(orchestrator.run_with_updates(table, updates, shutdown_rx))
    } else {
        tokio::spawn(orchestrator.run(table, shutdown_rx))
    };

    wait_for_signal().await?;

    // Signal shutdown to all apps
    let _ = shutdown_tx.send(true);
    store.close();

    if let Err(e) = orchestrator_handle.await {
        warn!(error = %e, "Orchestrator task failed");
    }

    info!("skproxy shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            info!("Received SIGINT");
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM");
        }
    }
    Ok(())
}

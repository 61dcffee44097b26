//! e2cast Server - Standalone headless streaming gateway.
//!
//! Binds the e2cast control plane to an HTTP port: play intents in, live
//! HLS out. Designed to run as a background daemon next to an Enigma2
//! receiver.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use e2cast_core::{bootstrap_services, start_server, Config};
use parking_lot::RwLock;
use tokio::signal;

/// e2cast Server - Enigma2 receiver to IPTV streaming gateway.
#[derive(Parser, Debug)]
#[command(name = "e2cast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "E2CAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "E2CAST_PORT")]
    port: Option<u16>,

    /// Receiver base URL (overrides config file).
    #[arg(short = 'r', long, env = "E2CAST_RECEIVER")]
    receiver_base_url: Option<String>,

    /// HLS artifact root (overrides config file).
    #[arg(long, env = "E2CAST_HLS_DIR")]
    hls_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("e2cast Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = config::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.preferred_port = port;
    }
    if let Some(url) = args.receiver_base_url {
        config.receiver_base_url = url;
    }
    if let Some(hls_root) = args.hls_root {
        config.hls_root = hls_root;
    }

    log::info!(
        "Configuration: port={}, receiver={}, store={}, worker_mode={:?}, tuner_slots={:?}",
        config.preferred_port,
        config.receiver_base_url,
        config.store_backend,
        config.worker_mode,
        config.tuner_slots
    );

    // Bootstrap services (validates config, opens the store, flushes leases)
    let services = bootstrap_services(&config).context("Failed to bootstrap services")?;

    // Start background tasks (orchestrator intake, sweeper, VOD cache sweep)
    services.start_background_tasks();
    log::info!("Background tasks started");

    // Build app state for the HTTP server
    let shared_config = Arc::new(RwLock::new(config));
    let app_state = services.app_state(Arc::clone(&shared_config));

    // Spawn the HTTP server on the main runtime.
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state).await {
            log::error!("Server error: {}", e);
        }
    });

    // Hot-reload the tunable subset on SIGHUP.
    #[cfg(unix)]
    spawn_reload_task(args.config.clone(), Arc::clone(&shared_config));

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, draining...");

    // Graceful shutdown: refuse new intents, cancel workers and sweepers.
    services.shutdown();

    // Give in-flight session teardowns a moment to release their children.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    server_handle.abort();
    log::info!("Shutdown complete");
    Ok(())
}

/// Re-reads the config file on SIGHUP and merges the reloadable subset.
#[cfg(unix)]
fn spawn_reload_task(path: Option<PathBuf>, shared: Arc<RwLock<Config>>) {
    let Some(path) = path else {
        return;
    };
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                log::warn!("Cannot install SIGHUP handler: {}", e);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match config::load(Some(&path)) {
                Ok(fresh) => {
                    shared.write().merge_reloadable(&fresh);
                    log::info!("Reloaded tunable configuration from {}", path.display());
                }
                Err(e) => log::warn!("Config reload failed: {}", e),
            }
        }
    });
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

//! tethercam Server
//!
//! Tethered camera control service for a USB-attached camera. Serializes
//! all device access through one worker thread, supervises the connection
//! with tiered recovery (reconnect, USB bus reset, terminal error), and
//! fans paced live-preview frames out to subscribers.

mod app;
mod camera;
mod config;
mod service;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tethercam-server")]
#[command(
    author,
    version,
    about = "Tethered camera control service with live preview"
)]
#[command(long_about = "
Controls a USB-attached camera through the gphoto2 command-line tool.
All device access is serialized through a dedicated worker thread; a
stuck camera is recovered automatically with reconnects and USB bus
resets, within a bounded budget.

EXAMPLES:
    # Run with default config
    tethercam-server

    # Run with custom config
    tethercam-server --config /path/to/config.toml

    # Detect the attached camera and exit
    tethercam-server --probe

    # Run with debug logging
    tethercam-server --log-level debug

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/tethercam/server.toml
    3. /etc/tethercam/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Detect and print the attached camera, then exit
    #[arg(long)]
    probe: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = config::ServerConfig::default();
        let path = config::ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    // Load configuration first (to get log level from config if not specified)
    let config = if let Some(ref path) = args.config {
        config::ServerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        config::ServerConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.service.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("tethercam Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.probe {
        return app::probe(&config).await;
    }

    run_service(config).await
}

/// Run the service until a shutdown signal arrives
async fn run_service(config: config::ServerConfig) -> Result<()> {
    if service::is_systemd() {
        info!("Running under systemd");
    }

    let app = app::App::build(config).context("Failed to build application context")?;

    // Start watchdog task if enabled
    let watchdog_handle = service::spawn_watchdog_task()
        .await
        .context("Failed to spawn watchdog task")?;

    // Notify systemd that we're ready
    service::notify_ready().context("Failed to notify systemd ready")?;

    // A failed initial connect is not fatal: the supervisor sits in its
    // terminal state until an operator requests a restart
    match app.initialize().await {
        Ok(()) => {
            service::notify_status("Running - camera connected")
                .context("Failed to send status to systemd")?;
        }
        Err(e) => {
            error!("Initial camera connect failed: {}", e);
            service::notify_status("Running - camera unavailable")
                .context("Failed to send status to systemd")?;
        }
    }

    info!("Press Ctrl+C to shutdown");

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        Err(e) => {
            error!("Error waiting for Ctrl+C: {}", e);
        }
    }

    // Notify systemd we're stopping
    service::notify_stopping().context("Failed to notify systemd stopping")?;

    // Stop watchdog
    watchdog_handle.abort();

    app.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

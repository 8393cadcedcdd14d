//! hermes-server
//!
//! Device-side service: registers the built-in sensors, watches for USB
//! serial adapters and cameras, and serves the control plane until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use server::HermesService;
use server::config::{ServerConfig, load_config};
use server::hardware::Hardware;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "hermes-server")]
#[command(author, version, about = "Expose device peripherals as remotely controlled assets")]
#[command(long_about = "
Exposes the IMU, GNSS receiver, USB-serial adapters and USB cameras of this
device as assets that a remote controller can list, configure, start and stop.

EXAMPLES:
    # Run with default config
    hermes-server

    # Run with custom config
    hermes-server --config /path/to/server.toml

    # Print the asset catalog and exit
    hermes-server --list-assets

    # Run with debug logging
    hermes-server --log-level debug

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hermes/server.toml
    3. /etc/hermes/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Start, print the asset catalog once hot-plug settled, and exit
    #[arg(long)]
    list_assets: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ServerConfig::default();
        let path = ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        load_config(path).context("Failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("hermes-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    // Asset start/stop blocks on per-device workers, keep it off the runtime
    let service = tokio::task::spawn_blocking(move || {
        let hardware = Hardware::from_config(&config);
        HermesService::start(&config, hardware)
    })
    .await
    .context("Service start-up task failed")??;

    if args.list_assets {
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        println!("{}", service.manager().catalog_json());
    } else {
        info!("Press Ctrl+C to shutdown");
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        }
    }

    tokio::task::spawn_blocking(move || {
        let mut service = service;
        service.shutdown();
    })
    .await
    .context("Service shutdown task failed")?;

    info!("Server shutdown complete");
    Ok(())
}

//! hermes-ctl
//!
//! Remote controller for hermes devices: lists, configures, starts and
//! stops assets and prints data-plane streams.

mod config;
mod control;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::setup_logging;
use control::{Controller, parse_override};
use protocol::AssetType;
use serde_json::Map;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "hermes-ctl")]
#[command(author, version, about = "Control the assets of a hermes device")]
#[command(long_about = "
Talks to a device running hermes-server over its control ports.

EXAMPLES:
    # Show the asset catalog of a device
    hermes-ctl --device 192.168.4.1 catalog

    # Start the IMU at 60 Hz and print its records
    hermes-ctl --device rover start imu in72e --set fps=60
    hermes-ctl --device rover tail 10010

    # Start a USB-serial adapter at 9600 baud
    hermes-ctl --device rover start usb_serial 2 --set baud=9600

CONFIGURATION:
    The controller looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hermes/client.toml
    3. /etc/hermes/client.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Device profile name or host
    #[arg(short, long, value_name = "DEVICE")]
    device: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Become the device's controller
    Subscribe,
    /// Release the device; every streaming asset is stopped
    Unsubscribe,
    /// Subscribe and print the asset catalog
    Catalog {
        /// How long to wait for the catalog, in seconds
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },
    /// Start an asset, optionally overriding config fields
    Start {
        /// Asset type alias (imu, gnss, usb_serial, cam)
        asset_type: String,
        id: String,
        /// Field override as key=value, repeatable
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },
    /// Stop a streaming asset
    Stop { asset_type: String, id: String },
    /// Print the device identity
    Identity,
    /// Send a signal code to the device
    Signal { code: i32 },
    /// Ask the device to join a Wi-Fi network
    Wifi {
        ssid: String,
        #[arg(long, default_value = "")]
        password: String,
    },
    /// Print records from a data-plane port until Ctrl+C
    Tail {
        port: u16,
        /// Stop after this many records
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
}

fn asset_type(alias: &str) -> Result<AssetType> {
    match AssetType::from_alias(alias) {
        AssetType::Unknown => anyhow::bail!("Unknown asset type '{}'", alias),
        known => Ok(known),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = config::ClientConfig::default();
        let path = config::ClientConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        config::ClientConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.client.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    let Some(command) = args.command else {
        anyhow::bail!("No command given, see --help");
    };

    let device = config.resolve_device(args.device.as_deref())?;
    info!("Using device {} ({})", device.name, device.host);
    let controller = Controller::new(device, config.client.timeout());

    if let Command::Tail { port, count } = command {
        return tail(controller, port, count).await;
    }

    // Every other command is a single short request
    tokio::task::spawn_blocking(move || run(&controller, command))
        .await
        .context("Command task failed")?
}

fn run(controller: &Controller, command: Command) -> Result<()> {
    match command {
        Command::Subscribe => {
            controller.subscribe(true)?;
            println!("Subscribed");
        }
        Command::Unsubscribe => {
            controller.subscribe(false)?;
            println!("Unsubscribed");
        }
        Command::Catalog { wait } => {
            let catalog = controller.catalog(Duration::from_secs(wait))?;
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
        Command::Start {
            asset_type: alias,
            id,
            overrides,
        } => {
            let mut config = Map::new();
            for arg in &overrides {
                let (key, value) = parse_override(arg)?;
                config.insert(key, value);
            }
            controller.start(&id, asset_type(&alias)?, config)?;
            println!("Started {}-{}", alias, id);
        }
        Command::Stop {
            asset_type: alias,
            id,
        } => {
            controller.stop(&id, asset_type(&alias)?)?;
            println!("Stopped {}-{}", alias, id);
        }
        Command::Identity => {
            let identity = controller.identity()?;
            println!(
                "{} ({}) version {}, asset state on port {}",
                identity.name, identity.id, identity.version, identity.state_port
            );
        }
        Command::Signal { code } => {
            controller.signal(code)?;
            println!("Signal {} sent", code);
        }
        Command::Wifi { ssid, password } => {
            controller.connect_wifi(&ssid, &password)?;
            println!("Joining {}", ssid);
        }
        Command::Tail { .. } => {}
    }
    Ok(())
}

async fn tail(controller: Controller, port: u16, count: Option<usize>) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_reader = stop.clone();
    let reader = tokio::task::spawn_blocking(move || {
        let mut seen = 0usize;
        controller.tail(port, &stop_reader, |line| {
            println!("{}", line);
            seen += 1;
            count.is_none_or(|max| seen < max)
        })
    });

    tokio::select! {
        result = reader => result.context("Tail task failed")?,
        _ = signal::ctrl_c() => {
            stop.store(true, Ordering::Relaxed);
            info!("Interrupted");
            Ok(())
        }
    }
}

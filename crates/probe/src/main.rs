//! usb-probe
//!
//! Lists the USB devices attached to this host as a bus/device/configuration
//! tree or as JSON, optionally waiting for a particular device to appear.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use host::{DeviceFilter, Session};
use probe::{ProbeConfig, device_summary, load_config, render_json, render_tree};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "usb-probe")]
#[command(author, version, about = "usb-probe - Inspect USB devices on this host")]
#[command(long_about = "
Enumerates the USB buses of this host and prints every device with its
configurations, interfaces and endpoints.

EXAMPLES:
    # Print the device tree
    usb-probe

    # Include manufacturer/product/serial strings
    usb-probe --strings

    # Only show one vendor's devices, as JSON
    usb-probe --filter 0x0555:* --json

    # Wait up to 10 seconds for a device to be plugged in
    usb-probe --filter 0x0555:0x000c --wait 10

CONFIGURATION:
    The probe looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-probe/probe.toml
    3. /etc/usb-probe/probe.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Only show devices matching VID:PID (repeatable, e.g. 0x0555:*)
    #[arg(short, long = "filter", value_name = "VID:PID")]
    filters: Vec<DeviceFilter>,

    /// Read string descriptors for each device
    #[arg(short, long)]
    strings: bool,

    /// Print JSON instead of a tree
    #[arg(long)]
    json: bool,

    /// Wait up to SECS for a device matching the first filter
    #[arg(short, long, value_name = "SECS")]
    wait: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ProbeConfig::default();
        let path = ProbeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        load_config(path).context("Failed to load configuration")?
    } else {
        ProbeConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.probe.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-probe v{}", env!("CARGO_PKG_VERSION"));

    let mut session_config = config.host.clone();
    if !args.filters.is_empty() {
        session_config.filters = args.filters.clone();
    }

    let session = Session::native(session_config).context("Failed to initialize USB session")?;
    let result = run(&session, &args, &config).await;
    session.teardown();
    result
}

async fn run(session: &Session, args: &Args, config: &ProbeConfig) -> Result<()> {
    if let Some(secs) = args.wait {
        let filter = args.filters.first().copied().unwrap_or_default();
        info!("Waiting up to {}s for a device matching {}", secs, filter);
        let device = session
            .wait_for_device(&filter, Duration::from_secs(secs))
            .await
            .with_context(|| format!("No device matching {} appeared", filter))?;
        println!("Found {}", device_summary(&device));
    }

    let topology = if args.strings || config.probe.read_strings {
        session.enumerate_with_strings().await
    } else {
        session.enumerate()
    }
    .context("Failed to enumerate USB devices")?;

    if args.json || config.probe.json {
        println!("{}", render_json(&topology)?);
    } else {
        print!("{}", render_tree(&topology));
    }

    Ok(())
}

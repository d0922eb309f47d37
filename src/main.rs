//! CLI entry point for the WTP bridge.
//!
//! One long-lived foreground process: open the serial link to the
//! microcontroller and the Modbus session to the PLC (both fatal if they
//! fail at startup), then run bridge cycles until Ctrl-C.
//!
//! # Usage
//!
//! Run with the shipped defaults:
//! ```bash
//! wtp-bridge run
//! ```
//!
//! Validate a site configuration without touching hardware:
//! ```bash
//! wtp-bridge --config site.toml check-config
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use wtp_bridge::bridge::{Bridge, BridgePolicy};
use wtp_bridge::config::BridgeSettings;
use wtp_bridge::gateway::ModbusGateway;
use wtp_bridge::logging;
use wtp_bridge::persist::{CsvSink, NullSink, PersistenceSink};
use wtp_bridge::serial::{drain_stale_bytes, open_serial};

#[derive(Parser)]
#[command(name = "wtp-bridge")]
#[command(about = "Serial-to-Modbus bridge for the WTP field unit", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until interrupted
    Run,
    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = BridgeSettings::load_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    settings
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    match cli.command {
        Commands::CheckConfig => {
            println!("configuration OK: {}", cli.config.display());
            Ok(())
        }
        Commands::Run => run(settings).await,
    }
}

async fn run(settings: BridgeSettings) -> Result<()> {
    logging::init(&settings.application.log_level).map_err(anyhow::Error::msg)?;
    info!(
        serial = %settings.serial.port,
        plc = %settings.plc.host,
        "starting WTP bridge"
    );

    // Both connections are fatal at startup: without either side there is
    // nothing to bridge.
    let mut serial = open_serial(&settings.serial.port, settings.serial.baud_rate)
        .await
        .context("serial port unavailable")?;

    let discarded = drain_stale_bytes(&mut serial, 200).await;
    if discarded > 0 {
        info!(bytes = discarded, "discarded stale serial bytes");
    }

    let plc_addr = settings.plc.socket_addr().map_err(anyhow::Error::msg)?;
    let gateway = ModbusGateway::connect(
        plc_addr,
        settings.plc.address_map.clone(),
        settings.plc.call_timeout,
    )
    .await
    .with_context(|| format!("PLC unreachable at {plc_addr}"))?;
    info!(%plc_addr, "connected to PLC");

    let sink: Box<dyn PersistenceSink> = if settings.persistence.enabled {
        let sink = CsvSink::create(&settings.persistence.output_dir)
            .context("failed to create persistence sink")?;
        info!(path = %sink.path().display(), "persisting cycles");
        Box::new(sink)
    } else {
        Box::new(NullSink)
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let policy = BridgePolicy {
        read_timeout: settings.serial.read_timeout,
        backoff: settings.policy.backoff,
        reconnect_after: settings.policy.reconnect_after,
    };

    Bridge::new(serial, gateway, sink, policy, shutdown_rx)
        .run()
        .await?;
    Ok(())
}

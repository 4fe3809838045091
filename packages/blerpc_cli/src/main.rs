//! blerpc CLI
//!
//! Exercises the BLE RPC transport: an end-to-end echo over the in-process
//! simulator, UUID expansion and config inspection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use blerpc::ble::simulated::SimBleNetwork;
use blerpc::uuid_util::expand_short_uuid;
use blerpc::{
    BleError, CentralConfig, CentralConnector, Connection, PeripheralConfig, PeripheralRegistry,
};

#[derive(Parser)]
#[command(name = "blerpc")]
#[command(author, version, about = "BLE RPC transport tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Echo messages between a simulated central and peripheral
    Loopback {
        /// Number of messages to send
        #[arg(short = 'n', long, default_value = "10")]
        messages: usize,

        /// Size of the largest message; sizes ramp up from 0
        #[arg(long, default_value = "10000")]
        max_size: usize,

        /// Central settings (JSON); defaults when omitted
        #[arg(long, value_name = "FILE")]
        central_config: Option<PathBuf>,

        /// Peripheral settings (JSON); defaults when omitted
        #[arg(long, value_name = "FILE")]
        peripheral_config: Option<PathBuf>,
    },

    /// Expand a 16/32-bit Bluetooth UUID to its 128-bit form
    ExpandUuid {
        /// Short UUID such as FFE2
        short: String,
    },

    /// Print a config file with defaults applied
    ShowConfig {
        #[arg(value_enum)]
        role: Role,

        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Scan the host adapter for peripherals matching the central config
    #[cfg(feature = "ble-central")]
    Scan {
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Central,
    Peripheral,
}

fn central_config(path: Option<&PathBuf>) -> Result<CentralConfig> {
    match path {
        Some(path) => CentralConfig::from_file(path)
            .with_context(|| format!("loading central config {}", path.display())),
        None => Ok(CentralConfig::default()),
    }
}

fn peripheral_config(path: Option<&PathBuf>) -> Result<PeripheralConfig> {
    match path {
        Some(path) => PeripheralConfig::from_file(path)
            .with_context(|| format!("loading peripheral config {}", path.display())),
        None => Ok(PeripheralConfig::default()),
    }
}

fn message_of(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

async fn loopback(
    messages: usize,
    max_size: usize,
    central: CentralConfig,
    peripheral: PeripheralConfig,
) -> Result<()> {
    anyhow::ensure!(
        central.delimited && peripheral.delimited,
        "loopback needs delimited framing on both sides"
    );
    let network = SimBleNetwork::new();
    let registry = PeripheralRegistry::start(peripheral, Arc::new(network.create_peripheral()))
        .await
        .context("starting the simulated peripheral")?;
    let connector = CentralConnector::new(central, Arc::new(network.create_central()))?;

    let server_registry = Arc::clone(&registry);
    let server = tokio::spawn(async move {
        let connection = server_registry.create_connection().await?;
        let mut echoed = 0usize;
        loop {
            match connection.receive_message().await {
                Ok(message) => match connection.send_message(&message).await {
                    Ok(()) => echoed += 1,
                    // The central closes once it has the reply; the last
                    // acknowledgment may never come.
                    Err(BleError::Closed) if connection.is_closed() => {
                        echoed += 1;
                        break;
                    }
                    Err(e) => return Err(e),
                },
                Err(e) if e.is_end_of_stream() => break,
                Err(e) => return Err(e),
            }
        }
        Ok::<usize, BleError>(echoed)
    });

    let connection = connector
        .create_connection()
        .await
        .context("connecting to the simulated peripheral")?;

    let started = Instant::now();
    let mut bytes = 0usize;
    for i in 0..messages {
        let size = if messages > 1 {
            max_size * i / (messages - 1)
        } else {
            max_size
        };
        let message = message_of(size);
        let sent_at = Instant::now();
        connection.send_message(&message).await?;
        let reply = connection.receive_message().await?;
        anyhow::ensure!(
            reply == message,
            "echo mismatch for message {} ({} bytes)",
            i,
            size
        );
        log::info!(
            "Message {}: {} bytes echoed in {} ms",
            i,
            size,
            sent_at.elapsed().as_millis()
        );
        bytes += size;
    }
    let elapsed = started.elapsed();

    connection.close().await?;
    let echoed = server.await.context("echo task panicked")??;
    registry.shutdown().await;

    println!(
        "{} messages ({} bytes) echoed in {} ms",
        echoed,
        bytes,
        elapsed.as_millis()
    );
    Ok(())
}

#[cfg(feature = "ble-central")]
async fn scan(config: CentralConfig) -> Result<()> {
    use blerpc::central::btleplug::BtleplugCentral;

    let transport = BtleplugCentral::new()
        .await
        .context("opening the Bluetooth adapter")?;
    let connector = CentralConnector::new(config, Arc::new(transport))?;
    let peers = connector.discover().await?;
    if peers.is_empty() {
        println!("No matching peripherals found");
    }
    for peer in peers {
        println!(
            "{}  {:<24}  rssi {}",
            peer.address,
            peer.name.as_deref().unwrap_or("-"),
            peer.rssi.map_or_else(|| "?".to_string(), |r| r.to_string())
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Loopback {
            messages,
            max_size,
            central_config: central_path,
            peripheral_config: peripheral_path,
        } => {
            let central = central_config(central_path.as_ref())?;
            let peripheral = peripheral_config(peripheral_path.as_ref())?;
            loopback(messages, max_size, central, peripheral).await
        }
        Commands::ExpandUuid { short } => {
            println!("{}", expand_short_uuid(&short)?);
            Ok(())
        }
        Commands::ShowConfig { role, file } => {
            let json = match role {
                Role::Central => serde_json::to_string_pretty(&central_config(file.as_ref())?)?,
                Role::Peripheral => {
                    serde_json::to_string_pretty(&peripheral_config(file.as_ref())?)?
                }
            };
            println!("{}", json);
            Ok(())
        }
        #[cfg(feature = "ble-central")]
        Commands::Scan { config } => scan(central_config(config.as_ref())?).await,
    }
}

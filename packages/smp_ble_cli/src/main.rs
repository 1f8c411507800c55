//! smp-ble: talk SMP to a device over BLE

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use smp_ble::ble::btleplug_link::BtleplugCentral;
use smp_ble::{SmpBleTransport, SmpHeader, SmpTransport, TransportConfig, HEADER_SIZE};

#[derive(Parser)]
#[command(name = "smp-ble", about = "Send SMP requests to a device over BLE")]
struct Cli {
    /// Transport configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Per-write payload size in bytes, when the link is known to negotiate
    /// more than the default 20
    #[arg(long, global = true)]
    mtu: Option<usize>,

    /// Seconds to wait for a response
    #[arg(long, global = true, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List devices advertising the SMP service
    Scan,
    /// Send one encoded SMP request and print the response as hex
    Send {
        /// Device name, MAC address, or platform UUID
        device: String,
        /// Request frame (header and payload) as hex
        request: String,
    },
    /// Connect and report the write payload size
    Mtu { device: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TransportConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TransportConfig::default(),
    };

    let mut central = BtleplugCentral::new().await?;
    if let Some(mtu) = cli.mtu {
        central = central.with_mtu(mtu);
    }
    let transport = SmpBleTransport::with_config(Arc::new(central), config);

    match cli.command {
        Command::Scan => scan(&transport).await,
        Command::Send { device, request } => {
            send(&transport, &device, &request, Duration::from_secs(cli.timeout)).await
        }
        Command::Mtu { device } => mtu(&transport, &device).await,
    }
}

async fn scan(transport: &SmpBleTransport) -> Result<()> {
    let devices = transport.scan().await?;
    if devices.is_empty() {
        println!("No SMP servers found");
        return Ok(());
    }
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "-".into());
        println!(
            "{}  {:<24} {}",
            device.address,
            device.name.as_deref().unwrap_or("(unnamed)"),
            rssi
        );
    }
    Ok(())
}

async fn send(
    transport: &SmpBleTransport,
    device: &str,
    request: &str,
    timeout: Duration,
) -> Result<()> {
    let cleaned: String = request.chars().filter(|c| !c.is_whitespace()).collect();
    let frame = hex::decode(&cleaned).context("request is not valid hex")?;
    if frame.len() < HEADER_SIZE {
        bail!("request is {} bytes, shorter than the SMP header", frame.len());
    }
    let header = SmpHeader::decode(&frame)?;
    if header.total_length() != frame.len() {
        log::warn!(
            "Header declares {} bytes but the request is {}",
            header.total_length(),
            frame.len()
        );
    }

    transport.connect(device).await?;
    let result = tokio::time::timeout(timeout, transport.send_and_receive(&frame)).await;
    transport.disconnect().await?;

    let response = match result {
        Ok(response) => response?,
        Err(_) => bail!("no response within {:?}", timeout),
    };
    match SmpHeader::decode(&response) {
        Ok(header) => log::info!("Response header: {:?}", header),
        Err(e) => log::warn!("Response header did not decode: {}", e),
    }
    println!("{}", hex::encode(&response));
    Ok(())
}

async fn mtu(transport: &SmpBleTransport, device: &str) -> Result<()> {
    transport.connect(device).await?;
    let mtu = transport.mtu()?;
    let max = transport.max_unencoded_size()?;
    transport.disconnect().await?;
    println!("mtu: {}", mtu);
    println!("max unencoded size: {}", max);
    Ok(())
}

use anyhow::Result;
use clap::Parser;
use gascard_lib::GascardOptions;
use gascard_lib::discovery::{candidate_ports, discover};

/// Probe serial ports for Gascard sensors.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Ports to probe. Defaults to every serial port the system reports.
    ports: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let cli = Cli::parse();

    let ports = if cli.ports.is_empty() { candidate_ports()? } else { cli.ports };
    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    println!("Probing {} port(s)...", ports.len());
    let mut devices = discover(&ports, &GascardOptions::default()).await;
    if devices.is_empty() {
        println!("No Gascard found.");
        return Ok(());
    }

    for device in &mut devices {
        println!("{}  {}", device.port(), serde_json::to_string(device.device_info())?);
        device.close().await?;
    }
    Ok(())
}

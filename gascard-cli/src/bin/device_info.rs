use anyhow::{Context, Result};
use clap::Parser;
use gascard_lib::{Gascard, GascardOptions};

/// Connect to one Gascard and print its identity and, optionally, some fields.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial port the sensor is attached to.
    port: String,
    /// Field to read. Repeatable; `--all` reads the Normal-mode record.
    #[arg(short, long = "field")]
    fields: Vec<String>,
    /// Read the full Normal-mode record.
    #[arg(long)]
    all: bool,
    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let cli = Cli::parse();

    println!("Connecting to Gascard on {}...", cli.port);
    let mut device = Gascard::connect(&cli.port, &GascardOptions::default())
        .await
        .with_context(|| format!("No Gascard answered on {}", cli.port))?;
    println!("Connected!\n");

    let values = if cli.all || !cli.fields.is_empty() {
        Some(device.get(&cli.fields).await?)
    } else {
        None
    };

    if cli.json {
        let output = serde_json::json!({
            "port": device.port(),
            "device_info": device.device_info(),
            "values": values,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("============================================================");
        println!("DEVICE INFORMATION");
        println!("============================================================");
        for (name, value) in device.device_info().iter() {
            println!("{:<20}{}", format!("{name}:"), value);
        }
        if let Some(values) = &values {
            println!();
            for (name, value) in values.iter() {
                println!("{:<20}{}", format!("{name}:"), value);
            }
        }
    }

    device.close().await?;
    Ok(())
}

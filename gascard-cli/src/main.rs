use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::{signal, time::sleep};

use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use gascard_lib::config::{LoggerConfig, OutputKind};
use gascard_lib::{PortSpec, Registry, Scheduler, WriteMode};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Sqlite,
    Csv,
}

/// Sample one or more Gascard sensors at a fixed rate and store the readings.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Logger configuration file (YAML).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Device to sample as NAME=PORT. Repeatable; replaces the devices in the config file.
    #[arg(short, long = "device", value_parser = parse_device)]
    devices: Vec<(String, String)>,
    /// Sampling rate in Hz.
    #[arg(short, long)]
    rate: Option<f64>,
    /// Stop after this many seconds.
    #[arg(long)]
    duration: Option<f64>,
    /// Field to sample. Repeatable; defaults to the full Normal-mode record.
    #[arg(short, long = "field")]
    fields: Vec<String>,
    /// Output file for the samples.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Output format.
    #[arg(long, value_enum)]
    format: Option<Format>,
    /// Persist each batch on a worker thread while the next one is fetched.
    #[arg(long)]
    async_writes: bool,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn parse_device(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, port)) if !name.is_empty() && !port.is_empty() => Ok((name.to_string(), port.to_string())),
        _ => Err(format!("expected NAME=PORT, got {s:?}")),
    }
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_thread_ids(false);

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, DEBUG with -v, TRACE with -vv. RUST_LOG still wins.
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

fn load_config(cli: &Cli) -> Result<LoggerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            LoggerConfig::from_path(path).with_context(|| format!("Failed to load config from {:?}", path))?
        }
        None => LoggerConfig::default(),
    };

    if !cli.devices.is_empty() {
        config.devices = cli.devices.iter().cloned().collect();
    }
    if let Some(rate) = cli.rate {
        config.rate_hz = rate;
    }
    if cli.duration.is_some() {
        config.duration_s = cli.duration;
    }
    if !cli.fields.is_empty() {
        config.fields = cli.fields.clone();
    }
    if let Some(path) = &cli.output {
        config.output.path = path.clone();
    }
    if let Some(format) = cli.format {
        config.output.kind = match format {
            Format::Sqlite => OutputKind::Sqlite,
            Format::Csv => OutputKind::Csv,
        };
    }
    if cli.async_writes {
        config.write_mode = WriteMode::Asynchronous;
    }

    config.validate()?;
    if config.devices.is_empty() {
        bail!("No devices configured; pass --device NAME=PORT or list them in the config file");
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    if let Err(e) = run(&cli).await {
        error!("Logger failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let options = config.gascard_options().context("Invalid field selection")?;

    let mut registry: Registry = Registry::new(options);
    for (name, port) in &config.devices {
        registry
            .add(name, PortSpec::Identifier(port.clone()))
            .await
            .with_context(|| format!("Failed to connect {name} on {port}"))?;
        let info = registry.device_info(name)?;
        info!(name = %name, port = %port, info = %serde_json::to_string(info)?, "Device ready");
    }

    let sink = config
        .output
        .open()
        .with_context(|| format!("Failed to open output {:?}", config.output.path))?;
    info!(path = ?config.output.path, kind = ?config.output.kind, "Writing samples");

    let handle = Scheduler::start(registry, sink, config.scheduler_config())?;

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl+C received, stopping after the current tick...");
                handle.stop();
                break;
            }
            _ = sleep(Duration::from_millis(200)) => {
                if handle.is_finished() {
                    break;
                }
            }
        }
    }

    let mut report = handle.join().await.context("Scheduler task panicked")?;
    info!(
        ticks = report.ticks,
        skipped = report.skipped,
        failed_reads = report.failed_reads,
        desyncs = report.desyncs,
        "Logging finished"
    );
    if report.skipped > 0 {
        warn!("{} ticks were skipped; consider a lower --rate", report.skipped);
    }
    report.registry.close_all().await;

    match report.error {
        Some(e) => Err(e).context("Persistence failed"),
        None => Ok(()),
    }
}

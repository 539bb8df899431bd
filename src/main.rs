//! SolarFlow Bridge
//!
//! Usage:
//!   solarflow-bridge [OPTIONS] [COMMAND]
//!
//! Commands:
//!   run                      Run the bridge until SIGINT/SIGTERM (default)
//!   write <PROPERTY> <VALUE> Write one device property and exit
//!   check                    Validate the configuration and exit
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use solarflow_bridge::bridge::Bridge;
use solarflow_bridge::cloud::CloudClient;
use solarflow_bridge::config::Config;
use solarflow_bridge::control::{PropertyWrite, PROPERTY_NAMES};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Grid-power driven battery control for SolarFlow devices
#[derive(Parser, Debug)]
#[command(name = "solarflow-bridge")]
#[command(version)]
#[command(about = "Bridges smart-meter telemetry to SolarFlow battery commands")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge until SIGINT/SIGTERM
    Run,
    /// Write one device property on the cloud broker and exit
    Write {
        /// batteryTarget, acMode, socSet, minSoc, outputLimit or inputLimit
        property: String,
        value: String,
    },
    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(args.log_level, &config.log.level) {
        eprintln!("Error setting up logging: {}", e);
        return ExitCode::FAILURE;
    }
    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Check => {
            println!(
                "Configuration OK: {} -> {}/{}",
                config.local.address(),
                config.device.product_id,
                config.device.device_id
            );
            Ok(())
        }
        Command::Write { property, value } => write(config, &property, &value).await,
        Command::Run => run(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Level from `--log-level`, else `[log] level`, else `RUST_LOG`
fn init_logging(
    cli: Option<LogLevel>,
    configured: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match cli.map(LogLevel::as_str) {
        Some(level) => EnvFilter::try_new(level)?,
        None if !configured.trim().is_empty() => EnvFilter::try_new(configured)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init()
}

fn build_bridge(config: Config) -> Result<Bridge, Box<dyn std::error::Error>> {
    let cloud = CloudClient::new(&config.cloud)?;
    let bridge = Bridge::new(config, Arc::new(cloud.clone()))?.with_device_lookup(cloud);
    Ok(bridge)
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting SolarFlow Bridge");
    info!("  Local broker: {}", config.local.address());
    info!("  Telemetry topics: {}", config.local.topics.join(", "));
    info!("  Remote broker: {}", config.remote.address());
    info!(
        "  Device: {}/{}",
        config.device.product_id, config.device.device_id
    );
    info!("  Credential refresh: every {:?}", config.cloud.refresh_interval);

    let bridge = build_bridge(config)?;
    bridge.run(shutdown_signal()).await?;
    Ok(())
}

async fn write(
    config: Config,
    property: &str,
    value: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let write = PropertyWrite::parse(property, value, config.device.product_name.as_deref())
        .map_err(|e| format!("{} (known properties: {})", e, PROPERTY_NAMES.join(", ")))?;

    let bridge = build_bridge(config)?;
    bridge.write_property(write).await?;
    info!("Property written");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error setting up Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Error setting up SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

//! Plantwatch telemetry engine entry point
//!
//! Runs the live stream against the simulated kiln plant, or performs one-off
//! maintenance commands against the configuration.

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plantwatch_engine::config::LogFormat;
use plantwatch_engine::ingestion::SimulatedSource;
use plantwatch_engine::{EngineConfig, TelemetryEngine, TelemetryEvent};

/// Plantwatch telemetry engine command line interface
#[derive(Parser)]
#[command(name = "plantwatch-engine")]
#[command(about = "Plantwatch telemetry engine for live plant monitoring")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (overrides the configured level)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live stream until interrupted
    Run {
        /// Seed for the simulated source
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Run a fixed number of ingestion ticks without the scheduler
    Simulate {
        /// Number of ticks
        #[arg(short, long, default_value = "100")]
        ticks: usize,

        /// Seed for the simulated source
        #[arg(long, default_value = "7")]
        seed: u64,
    },

    /// Validate configuration
    Validate {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },

    /// Print the default configuration as TOML
    Defaults,

    /// Export metrics after a short simulated run
    Metrics {
        /// Output format (json, prometheus)
        #[arg(short, long, default_value = "json")]
        format: String,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = initialize_logging(&cli, &config) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let result = match cli.command {
        Some(Commands::Run { seed }) => run_engine(config, seed).await,
        Some(Commands::Simulate { ticks, seed }) => simulate(config, ticks, seed).await,
        Some(Commands::Validate { show }) => handle_config(&config, show),
        Some(Commands::Defaults) => print_defaults(),
        Some(Commands::Metrics { format, output }) => export_metrics(config, &format, output).await,
        None => run_engine(config, None).await,
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        process::exit(1);
    }
}

/// Initialize logging from the CLI flags, falling back to the configuration
fn initialize_logging(cli: &Cli, config: &EngineConfig) -> Result<()> {
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("plantwatch_engine={}", log_level).parse()?)
        .add_directive("tokio=warn".parse()?);

    if cli.json_logs || config.logging.format == LogFormat::Json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    Ok(())
}

fn load_configuration(cli: &Cli) -> Result<EngineConfig> {
    let path = match &cli.config {
        Some(path) => {
            if !path.exists() {
                bail!("configuration file not found: {}", path.display());
            }
            Some(path.clone())
        }
        None => EngineConfig::default_config_path().ok(),
    };

    EngineConfig::load_with_fallback(path.as_ref()).context("invalid configuration")
}

async fn run_engine(config: EngineConfig, seed: Option<u64>) -> Result<()> {
    let source = match seed {
        Some(seed) => SimulatedSource::new(seed),
        None => SimulatedSource::from_entropy(),
    };
    let engine = TelemetryEngine::builder(config).source(Box::new(source)).build()?;
    let mut events = engine.subscribe();

    engine.start().await?;
    info!(
        interval_ms = engine.sampling_interval_ms(),
        rules = engine.list_rules().len(),
        "Plantwatch engine running"
    );

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            event = events.recv() => match event {
                Ok(TelemetryEvent::Anomaly(anomaly)) => {
                    warn!(
                        channel = %anomaly.channel_id,
                        severity = ?anomaly.severity,
                        value = anomaly.observed_value,
                        "{}",
                        anomaly.description
                    );
                }
                Ok(TelemetryEvent::DataQuality { channel_id, issue, .. }) => {
                    warn!(channel = %channel_id, "Data quality: {}", issue);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event listener lagged behind the stream");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    info!("Initiating graceful shutdown");
    engine.stop().await?;
    Ok(())
}

async fn simulate(config: EngineConfig, ticks: usize, seed: u64) -> Result<()> {
    let engine = TelemetryEngine::builder(config)
        .source(Box::new(SimulatedSource::new(seed)))
        .build()?;

    let mut accepted = 0;
    for _ in 0..ticks {
        accepted += engine.tick().await;
    }

    let counters = engine.quality_counters();
    println!("Ticks: {}", ticks);
    println!("Samples accepted: {}", accepted);
    println!("Out of range: {}", counters.out_of_range);
    println!("Active alerts: {}", engine.list_active_alerts().len());
    for alert in engine.list_active_alerts() {
        println!("  [{:?}] {} {}", alert.severity, alert.channel_id, alert.description);
    }
    Ok(())
}

fn handle_config(config: &EngineConfig, show: bool) -> Result<()> {
    config.validate()?;
    if show {
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}

fn print_defaults() -> Result<()> {
    println!("{}", toml::to_string_pretty(&EngineConfig::default())?);
    Ok(())
}

async fn export_metrics(config: EngineConfig, format: &str, output: Option<PathBuf>) -> Result<()> {
    let engine = TelemetryEngine::new(config)?;
    for _ in 0..10 {
        engine.tick().await;
    }

    let metrics_output = engine.export_metrics(format)?;
    match output {
        Some(path) => {
            std::fs::write(&path, metrics_output)?;
            println!("Metrics exported to: {}", path.display());
        }
        None => println!("{}", metrics_output),
    }
    Ok(())
}

/// Wait for SIGTERM or Ctrl-C
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT, initiating graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl-C, initiating graceful shutdown");
    }
    Ok(())
}

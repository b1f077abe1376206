use std::path::PathBuf;
use std::process;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod error;
mod history;
mod output;
mod settings;

use plantwatch_engine::TelemetryEngine;

use commands::*;
use error::Result;
use output::{OutputFormat, OutputManager};
use settings::CliSettings;

#[derive(Parser)]
#[command(name = "plantctl")]
#[command(about = "Plantwatch CLI - rule management, calibration, export and replay for plant telemetry")]
#[command(version)]
#[command(long_about = "
Plantwatch CLI (plantctl) manages the persisted threshold rules, runs sensor
calibrations, and exports or replays recorded telemetry.

Examples:
  plantctl rules list                                         # Show threshold rules
  plantctl rules add -c system_pressure --condition below --value 2.5 -s medium
  plantctl calibrate manual kiln_temperature -r 100 -m 103    # Manual calibration
  plantctl export --simulate 300 --format json -o window.json # Export simulated history
  plantctl replay --input recording.csv --speed 2             # Replay a recording
  plantctl config show                                        # Show configuration
")]
struct Cli {
    /// Output format (table, json, csv, raw)
    #[arg(long, global = true)]
    output_format: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Engine configuration file
    #[arg(long, global = true, env = "PLANTWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// plantctl settings file
    #[arg(long, global = true, env = "PLANTCTL_SETTINGS")]
    settings: Option<PathBuf>,

    /// Directory holding persisted state (overrides the configuration)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage threshold rules
    Rules(RulesArgs),

    /// Inspect and run sensor calibration
    Calibrate(CalibrateArgs),

    /// Export a window of telemetry as CSV or JSON
    Export(ExportArgs),

    /// Replay recorded telemetry at a chosen speed
    Replay(ReplayArgs),

    /// Manage Plantwatch configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(&cli);

    if let Commands::Completions { shell } = cli.command {
        generate_completions(shell);
        return;
    }

    if let Err(e) = run_command(cli).await {
        eprintln!("{}", error::format_error(&e));
        process::exit(e.exit_code());
    }
}

async fn run_command(cli: Cli) -> Result<()> {
    let mut settings = CliSettings::load(cli.settings.as_deref())?;
    if cli.config.is_some() {
        settings.engine_config = cli.config.clone();
    }
    if cli.state_dir.is_some() {
        settings.state_dir = cli.state_dir.clone();
    }

    let format = match cli.output_format {
        Some(format) => format,
        None => settings
            .format
            .parse()
            .map_err(error::CliError::InvalidArgument)?,
    };
    let colored = settings.color && !cli.no_color && !cli.quiet && console::Term::stdout().features().colors_supported();
    let output = OutputManager::new(format, colored);

    match cli.command {
        Commands::Config(args) => commands::config::run(args, &settings, output).await,
        Commands::Rules(args) => commands::rules::run(args, build_engine(&settings)?, output).await,
        Commands::Calibrate(args) => commands::calibrate::run(args, build_engine(&settings)?, output).await,
        Commands::Export(args) => commands::export::run(args, build_engine(&settings)?, &settings, output).await,
        Commands::Replay(args) => commands::replay::run(args, build_engine(&settings)?, &settings, output).await,
        Commands::Completions { .. } => unreachable!("Completions handled earlier"),
    }
}

fn build_engine(settings: &CliSettings) -> Result<TelemetryEngine> {
    let mut config = settings.engine_config()?;
    config.metrics.enabled = false;
    info!("Using state directory {}", config.persistence.state_dir.display());
    Ok(TelemetryEngine::new(config)?)
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else if cli.verbose {
        tracing::Level::INFO
    } else if cli.quiet {
        tracing::Level::ERROR
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("plantctl={0},plantwatch_engine={0}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn generate_completions(shell: clap_complete::Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert()
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["plantctl", "rules", "list"]).unwrap();
        assert!(matches!(cli.command, Commands::Rules(_)));

        let cli = Cli::try_parse_from(["plantctl", "--output-format", "json", "--verbose", "config", "path"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.output_format, Some(OutputFormat::Json));

        let cli = Cli::try_parse_from([
            "plantctl", "rules", "add", "-c", "system_pressure", "--condition", "below", "--value", "2.5",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Rules(_)));
    }

    #[test]
    fn test_invalid_condition_is_rejected() {
        let result = Cli::try_parse_from([
            "plantctl", "rules", "add", "-c", "system_pressure", "--condition", "sideways", "--value", "2.5",
        ]);
        assert!(result.is_err());
    }
}

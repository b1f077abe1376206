use std::path::PathBuf;

use clap::{Args, Subcommand};

use plantwatch_engine::{EngineConfig, EngineError};

use crate::error::{CliError, Result};
use crate::output::{OutputFormat, OutputManager};
use crate::settings::{self, CliSettings};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Configuration action
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective engine configuration
    Show {
        /// Show plantctl's own settings instead
        #[arg(long)]
        cli: bool,
    },

    /// Print the configuration file locations
    Path,

    /// Validate an engine configuration file
    Validate {
        /// Configuration file path (default: the effective configuration)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Write the default engine configuration
    Init {
        /// Destination (default: the engine's default config path)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs, settings: &CliSettings, output: OutputManager) -> Result<()> {
    match args.action {
        ConfigAction::Show { cli } => {
            if cli {
                return print_structured(&output, settings);
            }
            print_structured(&output, &settings.engine_config()?)
        }
        ConfigAction::Path => {
            let engine_path = match &settings.engine_config {
                Some(path) => path.clone(),
                None => EngineConfig::default_config_path().map_err(EngineError::from)?,
            };
            println!("engine:   {}", engine_path.display());
            println!("settings: {}", settings::settings_path()?.display());
            Ok(())
        }
        ConfigAction::Validate { file } => {
            match file {
                Some(path) => {
                    if !path.exists() {
                        return Err(CliError::FileNotFound {
                            path: path.to_string_lossy().to_string(),
                        });
                    }
                    EngineConfig::from_file(&path).map_err(EngineError::from)?;
                }
                None => {
                    settings.engine_config()?.validate().map_err(EngineError::from)?;
                }
            }
            output.print_success("Configuration is valid")
        }
        ConfigAction::Init { file, force } => {
            let path = match file {
                Some(path) => path,
                None => EngineConfig::default_config_path().map_err(EngineError::from)?,
            };
            if path.exists() && !force {
                return Err(CliError::InvalidArgument(format!(
                    "{} already exists, pass --force to overwrite",
                    path.display()
                )));
            }
            EngineConfig::default().save_to_file(&path).map_err(EngineError::from)?;
            output.print_success(&format!("Wrote default configuration to {}", path.display()))
        }
    }
}

fn print_structured<T: serde::Serialize>(output: &OutputManager, value: &T) -> Result<()> {
    match output.format() {
        OutputFormat::Json => output.print_json(value),
        _ => {
            println!("{}", toml::to_string_pretty(value)?);
            Ok(())
        }
    }
}

//! plantctl settings
//!
//! Small operator preferences layered with the `config` crate: built-in
//! defaults, then `plantctl.toml` in the user config directory (or the file
//! given with `--settings`), then `PLANTCTL_*` environment variables.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use plantwatch_engine::EngineConfig;

use crate::error::{CliError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliSettings {
    /// Engine configuration file; defaults to the engine's own default path
    pub engine_config: Option<PathBuf>,

    /// Overrides `persistence.state_dir` of the engine configuration
    pub state_dir: Option<PathBuf>,

    /// Default output format (table, json, csv, raw)
    pub format: String,

    pub color: bool,

    /// Seed used when simulating history
    pub seed: u64,
}

impl CliSettings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => settings_path()?,
        };

        let settings = Config::builder()
            .set_default("format", "table")?
            .set_default("color", true)?
            .set_default("seed", 7)?
            .add_source(File::from(path.as_path()).required(false))
            .add_source(Environment::with_prefix("PLANTCTL"))
            .build()?
            .try_deserialize()?;

        tracing::debug!("Loaded settings (file: {})", path.display());
        Ok(settings)
    }

    /// Engine configuration with the state directory override applied
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let path = match &self.engine_config {
            Some(path) if !path.exists() => {
                return Err(CliError::FileNotFound {
                    path: path.to_string_lossy().to_string(),
                })
            }
            Some(path) => Some(path.clone()),
            None => EngineConfig::default_config_path().ok(),
        };

        let mut config = EngineConfig::load_with_fallback(path.as_ref()).map_err(plantwatch_engine::EngineError::from)?;
        if let Some(state_dir) = &self.state_dir {
            config.persistence.state_dir = state_dir.clone();
        }
        Ok(config)
    }
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            engine_config: None,
            state_dir: None,
            format: "table".to_string(),
            color: true,
            seed: 7,
        }
    }
}

/// `plantctl.toml` in the user configuration directory
pub fn settings_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("plantwatch").join("plantctl.toml"))
        .ok_or_else(|| CliError::InvalidArgument("Unable to determine config directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let settings = CliSettings::load(Some(&dir.path().join("missing.toml"))).unwrap();
        assert_eq!(settings.format, "table");
        assert_eq!(settings.seed, 7);
        assert!(settings.engine_config.is_none());
    }

    #[test]
    fn test_file_layer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plantctl.toml");
        std::fs::write(&path, "format = \"json\"\nseed = 42\nstate_dir = \"/tmp/plant-state\"\n").unwrap();

        let settings = CliSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.format, "json");
        assert_eq!(settings.seed, 42);
        assert_eq!(settings.state_dir, Some(PathBuf::from("/tmp/plant-state")));
    }

    #[test]
    fn test_missing_engine_config_is_reported() {
        let settings = CliSettings {
            engine_config: Some(PathBuf::from("/nonexistent/engine.toml")),
            ..CliSettings::default()
        };
        assert!(matches!(settings.engine_config(), Err(CliError::FileNotFound { .. })));
    }
}

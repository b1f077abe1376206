//! Configuration management for the Plantwatch telemetry engine
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files and `PLANTWATCH_*` environment variables.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationPacing;
use crate::channel::{default_kiln_channels, Channel, ChannelRegistry};
use crate::error::{ConfigError, ConfigResult};
use crate::external::CallPolicy;
use crate::ingestion::{PumpSettings, MAX_SAMPLING_INTERVAL_MS, MIN_SAMPLING_INTERVAL_MS};
use crate::model::{ChannelId, Severity};
use crate::replay::{LookupMode, ReplaySettings};

pub const MIN_BUFFER_CAPACITY: usize = 100;
pub const MAX_BUFFER_CAPACITY: usize = 5000;

/// Main configuration structure for the engine service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ring buffer sizing and retention
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Ingestion pump cadence
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Detection and alert log settings
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Replay scheduler settings
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Automatic calibration pacing
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// External collaborator calls
    #[serde(default)]
    pub external: ExternalConfig,

    /// Where persisted state lives
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Static channel registry
    #[serde(default = "default_kiln_channels")]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Samples held per channel unless overridden
    pub default_capacity: usize,

    /// Samples older than this, relative to the newest, are pruned
    pub retention_secs: u64,

    /// Per-channel capacity overrides
    pub capacity_overrides: HashMap<ChannelId, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub sampling_interval_ms: u64,

    /// Restart the ingestion loop if it crashes
    pub auto_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub alert_log_capacity: usize,

    /// Publish every accepted sample on the event bus
    pub publish_samples: bool,

    /// Severity given to correlation deviations
    pub correlation_severity: Severity,

    pub event_bus_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub tick_period_ms: u64,
    pub skip_step_ms: i64,
    pub lookup: LookupMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub step_percent: u8,
    pub step_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    pub timeout_ms: u64,
    pub retry_on_timeout: bool,

    /// Base URL of the analytics warehouse, if one is used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warehouse_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory holding `rules.json`
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            ingestion: IngestionConfig::default(),
            detection: DetectionConfig::default(),
            replay: ReplayConfig::default(),
            calibration: CalibrationConfig::default(),
            external: ExternalConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            channels: default_kiln_channels(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            default_capacity: 1000,
            retention_secs: 24 * 60 * 60,
            capacity_overrides: HashMap::new(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 2000,
            auto_restart: true,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            alert_log_capacity: 1000,
            publish_samples: true,
            correlation_severity: Severity::Medium,
            event_bus_capacity: 1024,
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 100,
            skip_step_ms: 60_000,
            lookup: LookupMode::NearestBefore,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            step_percent: 10,
            step_interval_ms: 500,
        }
    }
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry_on_timeout: true,
            warehouse_url: None,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        // Use the user's local data directory for persisted rules
        let state_dir = dirs::data_local_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")))
            .join("plantwatch");

        Self { state_dir }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn parse_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> ConfigResult<Option<T>> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                value: raw,
            }),
        None => Ok(None),
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.to_string_lossy().to_string(),
        })?;

        let config: EngineConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `PLANTWATCH_*` environment variables
    pub fn from_env() -> ConfigResult<Self> {
        let config = EngineConfig::default().with_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback order: file -> env -> defaults
    pub fn load_with_fallback<P: AsRef<Path>>(config_path: Option<P>) -> ConfigResult<Self> {
        let mut config = EngineConfig::default();

        if let Some(path) = config_path {
            if path.as_ref().exists() {
                config = EngineConfig::from_file(path)?;
            } else {
                tracing::debug!("Config file {} not found, using defaults", path.as_ref().display());
            }
        }

        let config = config.with_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides looked up by environment variable name
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        if let Some(capacity) = parse_override(&lookup, "PLANTWATCH_BUFFER_CAPACITY")? {
            self.buffer.default_capacity = capacity;
        }
        if let Some(retention) = parse_override(&lookup, "PLANTWATCH_RETENTION_SECS")? {
            self.buffer.retention_secs = retention;
        }
        if let Some(interval) = parse_override(&lookup, "PLANTWATCH_SAMPLING_INTERVAL_MS")? {
            self.ingestion.sampling_interval_ms = interval;
        }
        if let Some(timeout) = parse_override(&lookup, "PLANTWATCH_EXTERNAL_TIMEOUT_MS")? {
            self.external.timeout_ms = timeout;
        }
        if let Some(url) = lookup("PLANTWATCH_WAREHOUSE_URL") {
            self.external.warehouse_url = Some(url);
        }
        if let Some(state_dir) = lookup("PLANTWATCH_STATE_DIR") {
            self.persistence.state_dir = PathBuf::from(state_dir);
        }
        if let Some(level) = lookup("PLANTWATCH_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = parse_override(&lookup, "PLANTWATCH_LOG_FORMAT")? {
            self.logging.format = format;
        }
        if let Some(enabled) = parse_override(&lookup, "PLANTWATCH_METRICS_ENABLED")? {
            self.metrics.enabled = enabled;
        }
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        let capacity_range = MIN_BUFFER_CAPACITY..=MAX_BUFFER_CAPACITY;
        if !capacity_range.contains(&self.buffer.default_capacity) {
            return Err(ConfigError::InvalidValue {
                field: "buffer.default_capacity".to_string(),
                value: self.buffer.default_capacity.to_string(),
            });
        }

        for (channel, capacity) in &self.buffer.capacity_overrides {
            if !capacity_range.contains(capacity) {
                return Err(ConfigError::InvalidValue {
                    field: format!("buffer.capacity_overrides.{}", channel),
                    value: capacity.to_string(),
                });
            }
            if !self.channels.iter().any(|c| &c.id == channel) {
                return Err(ConfigError::ValidationFailed {
                    reason: format!("capacity override for unknown channel {}", channel),
                });
            }
        }

        if self.buffer.retention_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "buffer.retention_secs".to_string(),
                value: "0".to_string(),
            });
        }

        let interval = self.ingestion.sampling_interval_ms;
        if !(MIN_SAMPLING_INTERVAL_MS..=MAX_SAMPLING_INTERVAL_MS).contains(&interval) {
            return Err(ConfigError::InvalidValue {
                field: "ingestion.sampling_interval_ms".to_string(),
                value: interval.to_string(),
            });
        }

        if self.detection.alert_log_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "detection.alert_log_capacity".to_string(),
                value: "0".to_string(),
            });
        }

        if self.detection.event_bus_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "detection.event_bus_capacity".to_string(),
                value: "0".to_string(),
            });
        }

        if self.replay.tick_period_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "replay.tick_period_ms".to_string(),
                value: "0".to_string(),
            });
        }

        if self.replay.skip_step_ms <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "replay.skip_step_ms".to_string(),
                value: self.replay.skip_step_ms.to_string(),
            });
        }

        if !(1..=100).contains(&self.calibration.step_percent) {
            return Err(ConfigError::InvalidValue {
                field: "calibration.step_percent".to_string(),
                value: self.calibration.step_percent.to_string(),
            });
        }

        if self.calibration.step_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "calibration.step_interval_ms".to_string(),
                value: "0".to_string(),
            });
        }

        if self.external.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "external.timeout_ms".to_string(),
                value: "0".to_string(),
            });
        }

        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                value: self.logging.level.clone(),
            });
        }

        self.registry()?;
        Ok(())
    }

    /// Build the channel registry declared by this configuration
    pub fn registry(&self) -> ConfigResult<ChannelRegistry> {
        ChannelRegistry::new(self.channels.clone())
    }

    pub fn retention_ms(&self) -> Option<i64> {
        i64::try_from(self.buffer.retention_secs.saturating_mul(1000)).ok()
    }

    pub fn pump_settings(&self) -> PumpSettings {
        PumpSettings {
            sampling_interval_ms: self.ingestion.sampling_interval_ms,
            auto_restart: self.ingestion.auto_restart,
            publish_samples: self.detection.publish_samples,
        }
    }

    pub fn replay_settings(&self) -> ReplaySettings {
        ReplaySettings {
            tick_period: Duration::from_millis(self.replay.tick_period_ms),
            skip_step_ms: self.replay.skip_step_ms,
            lookup: self.replay.lookup,
        }
    }

    pub fn calibration_pacing(&self) -> CalibrationPacing {
        CalibrationPacing {
            step_percent: self.calibration.step_percent,
            step_interval: Duration::from_millis(self.calibration.step_interval_ms),
        }
    }

    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_millis(self.external.timeout_ms),
            retry_on_timeout: self.external.retry_on_timeout,
        }
    }

    pub fn rules_path(&self) -> PathBuf {
        self.persistence.state_dir.join("rules.json")
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("plantwatch").join("engine.toml"))
            .ok_or_else(|| ConfigError::ValidationFailed {
                reason: "Unable to determine config directory".to_string(),
            })
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| ConfigError::ValidationFailed {
                reason: format!("Unable to create config directory: {}", parent.display()),
            })?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationFailed { reason: e.to_string() })?;

        fs::write(path, content).map_err(|_| ConfigError::PermissionDenied {
            path: path.to_string_lossy().to_string(),
        })?;

        Ok(())
    }
}

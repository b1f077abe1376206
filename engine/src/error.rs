//! Error handling for the Plantwatch telemetry engine
//!
//! This module provides the error taxonomy for every engine operation:
//! ring buffer admission, rule management, calibration, replay, export,
//! persistence and calls to external collaborators.

use std::io;

use thiserror::Error;

/// The main error type for the telemetry engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Ring buffer admission errors
    #[error("Ring buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Threshold rule errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Calibration errors
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// Replay errors
    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// External collaborator errors
    #[error("External service error: {0}")]
    External(#[from] ExternalError),

    /// Export errors
    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    /// Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Lifecycle errors (start/stop in the wrong state)
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

/// Ring buffer admission errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BufferError {
    #[error("Unknown channel: {channel}")]
    UnknownChannel { channel: String },

    #[error("Out of order sample on {channel}: {timestamp_ms} < last accepted {last_ms}")]
    OutOfOrder {
        channel: String,
        timestamp_ms: i64,
        last_ms: i64,
    },

    #[error("Out of range sample on {channel}: {value} outside [{min}, {max}]")]
    OutOfRange {
        channel: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid buffer capacity: {capacity}")]
    InvalidCapacity { capacity: usize },
}

/// Threshold rule errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("Invalid rule: {reason}")]
    InvalidRule { reason: String },

    #[error("Rule not found: {id}")]
    NotFound { id: String },

    #[error("Rule references unknown channel: {channel}")]
    UnknownChannel { channel: String },
}

/// Calibration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Calibration already in progress for sensor {sensor}")]
    CalibrationInProgress { sensor: String },

    #[error("Unknown sensor: {sensor}")]
    UnknownSensor { sensor: String },

    #[error("Invalid reference value {reference} for sensor {sensor}")]
    InvalidReference { sensor: String, reference: f64 },

    #[error("Sensor fault during calibration of {sensor}: {reason}")]
    SensorFault { sensor: String, reason: String },
}

/// Replay errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplayError {
    #[error("No replay session is open")]
    NoSession,

    #[error("Invalid replay window: [{start_ms}, {end_ms}]")]
    InvalidWindow { start_ms: i64, end_ms: i64 },

    #[error("No buffered samples to replay")]
    NothingBuffered,
}

/// Configuration related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Configuration file permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },
}

/// External collaborator errors (analytics warehouse, report generation)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExternalError {
    #[error("{service} timed out after {attempts} attempts")]
    ExternalServiceTimeout { service: String, attempts: u32 },

    #[error("{service} request failed: {reason}")]
    RequestFailed { service: String, reason: String },
}

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Unsupported export format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Invalid export window: {from_ms} > {to_ms}")]
    InvalidWindow { from_ms: i64, to_ms: i64 },

    #[error("CSV encoding failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("State file could not be read: {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("State file could not be written: {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("State file is corrupt: {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

/// A specialized result type for ring buffer operations
pub type BufferResult<T> = std::result::Result<T, BufferError>;

/// A specialized result type for rule operations
pub type RuleResult<T> = std::result::Result<T, RuleError>;

/// A specialized result type for calibration operations
pub type CalibrationResult<T> = std::result::Result<T, CalibrationError>;

/// A specialized result type for replay operations
pub type ReplayResult<T> = std::result::Result<T, ReplayError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for external calls
pub type ExternalResult<T> = std::result::Result<T, ExternalError>;

/// A specialized result type for export operations
pub type ExportResult<T> = std::result::Result<T, ExportError>;

/// A specialized result type for persistence operations
pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

impl EngineError {
    /// Check if this error is recoverable
    ///
    /// Data-quality rejects and external timeouts never stop the live stream.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Buffer(_) => true,
            EngineError::External(_) => true,
            EngineError::Rule(_) => true,
            EngineError::Calibration(_) => true,
            EngineError::Persistence(PersistenceError::Corrupt { .. }) => false,
            EngineError::Config(_) => false,
            EngineError::Io(io_error) => {
                matches!(io_error.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
            }
            _ => true,
        }
    }

    /// Check if this error requires immediate attention
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            EngineError::Persistence(PersistenceError::Corrupt { .. })
                | EngineError::Persistence(PersistenceError::WriteFailed { .. })
                | EngineError::Config(_)
        )
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Buffer(_) => "buffer",
            EngineError::Rule(_) => "rule",
            EngineError::Calibration(_) => "calibration",
            EngineError::Replay(_) => "replay",
            EngineError::Config(_) => "config",
            EngineError::External(_) => "external",
            EngineError::Export(_) => "export",
            EngineError::Persistence(_) => "persistence",
            EngineError::Io(_) => "io",
            EngineError::Lifecycle(_) => "lifecycle",
            EngineError::Generic(_) => "generic",
        }
    }
}

impl BufferError {
    /// Label used by the data-quality counters
    pub fn quality_label(&self) -> &'static str {
        match self {
            BufferError::UnknownChannel { .. } => "unknown_channel",
            BufferError::OutOfOrder { .. } => "out_of_order",
            BufferError::OutOfRange { .. } => "out_of_range",
            BufferError::InvalidCapacity { .. } => "invalid_capacity",
        }
    }
}

impl From<String> for EngineError {
    fn from(msg: String) -> Self {
        EngineError::Generic(msg)
    }
}

impl From<&str> for EngineError {
    fn from(msg: &str) -> Self {
        EngineError::Generic(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        let buffer_error = EngineError::Buffer(BufferError::OutOfOrder {
            channel: "kiln_temperature".to_string(),
            timestamp_ms: 10,
            last_ms: 20,
        });
        assert_eq!(buffer_error.category(), "buffer");
        assert!(buffer_error.is_recoverable());
        assert!(!buffer_error.is_critical());

        let corrupt = EngineError::Persistence(PersistenceError::Corrupt {
            path: "rules.json".to_string(),
            reason: "eof".to_string(),
        });
        assert_eq!(corrupt.category(), "persistence");
        assert!(!corrupt.is_recoverable());
        assert!(corrupt.is_critical());

        let timeout = EngineError::External(ExternalError::ExternalServiceTimeout {
            service: "warehouse".to_string(),
            attempts: 2,
        });
        assert!(timeout.is_recoverable());
        assert_eq!(timeout.category(), "external");
    }

    #[test]
    fn test_quality_labels() {
        let error = BufferError::UnknownChannel { channel: "x".to_string() };
        assert_eq!(error.quality_label(), "unknown_channel");
        let error = BufferError::OutOfRange {
            channel: "x".to_string(),
            value: 11.0,
            min: 0.0,
            max: 10.0,
        };
        assert_eq!(error.quality_label(), "out_of_range");
    }

    #[test]
    fn test_error_conversion() {
        let engine_error = EngineError::from("Test error".to_string());
        assert!(matches!(engine_error, EngineError::Generic(_)));

        let engine_error: EngineError = RuleError::NotFound { id: "rule-9".to_string() }.into();
        assert!(matches!(engine_error, EngineError::Rule(RuleError::NotFound { .. })));
    }
}

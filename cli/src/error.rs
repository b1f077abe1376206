use plantwatch_engine::error::ReplayError;
use plantwatch_engine::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("Date/time error: {0}")]
    DateTime(#[from] chrono::ParseError),

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No samples loaded")]
    NoHistory,

    #[error("Calibration of {sensor} failed: {reason}")]
    CalibrationFailed { sensor: String, reason: String },

    #[error("Operation cancelled by user")]
    Cancelled,
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Settings(_) => 1,
            CliError::Io(_) => 2,
            CliError::Engine(EngineError::Config(_)) => 3,
            CliError::Engine(EngineError::Persistence(_)) => 4,
            CliError::FileNotFound { .. } => 5,
            CliError::InvalidArgument(_) => 6,
            CliError::InvalidTimeRange(_) => 7,
            CliError::Engine(_) => 8,
            CliError::NoHistory => 9,
            CliError::CalibrationFailed { .. } => 10,
            CliError::Cancelled => 130,
            _ => 1,
        }
    }
}

impl From<ReplayError> for CliError {
    fn from(error: ReplayError) -> Self {
        CliError::Engine(error.into())
    }
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Format error for user-friendly display
pub fn format_error(error: &CliError) -> String {
    match error {
        CliError::Settings(e) => {
            format!("Settings Error: {}\n\nTry running 'plantctl config show' to check your configuration.", e)
        }
        CliError::Engine(EngineError::Rule(e)) => {
            format!("Rule Error: {}\n\nUse 'plantctl rules list' to see the current rules.", e)
        }
        CliError::Engine(EngineError::Config(e)) => {
            format!("Configuration Error: {}\n\nTry running 'plantctl config validate'.", e)
        }
        CliError::FileNotFound { path } => {
            format!("File Not Found: {}\n\nPlease check that the file exists and is accessible.", path)
        }
        CliError::InvalidTimeRange(msg) => {
            format!(
                "Invalid Time Range: {}\n\nSupported formats: epoch milliseconds or RFC 3339 ('2024-01-01T10:00:00Z').",
                msg
            )
        }
        CliError::NoHistory => {
            "No samples loaded: pass --input <recording.csv> or --simulate <ticks>.".to_string()
        }
        CliError::CalibrationFailed { sensor, reason } => {
            format!(
                "Calibration Failed: {}: {}\n\nThe previous calibration record is unchanged; check it with 'plantctl calibrate status {}'.",
                sensor, reason, sensor
            )
        }
        CliError::Cancelled => "Operation cancelled by user.".to_string(),
        _ => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plantwatch_engine::error::RuleError;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::NoHistory.exit_code(), 9);
        assert_eq!(CliError::Cancelled.exit_code(), 130);
        let failed = CliError::CalibrationFailed {
            sensor: "oxygen_level".to_string(),
            reason: "probe offline".to_string(),
        };
        assert_eq!(failed.exit_code(), 10);
        assert!(format_error(&failed).contains("plantctl calibrate status oxygen_level"));
        let rule = CliError::Engine(EngineError::Rule(RuleError::NotFound { id: "rule-3".to_string() }));
        assert_eq!(rule.exit_code(), 8);
        assert!(format_error(&rule).contains("plantctl rules list"));
    }
}

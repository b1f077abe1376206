use clap::{Args, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use plantwatch_engine::{CalibrationRecord, TelemetryEngine, TelemetryEvent};

use crate::error::{CliError, Result};
use crate::output::OutputManager;

#[derive(Args, Debug)]
pub struct CalibrateArgs {
    #[command(subcommand)]
    pub action: CalibrateAction,
}

#[derive(Subcommand, Debug)]
pub enum CalibrateAction {
    /// Show calibration status for one sensor or all of them
    Status {
        /// Sensor id
        sensor: Option<String>,
    },

    /// Record a manual calibration from a reference reading
    Manual {
        /// Sensor id
        sensor: String,

        /// Known reference value
        #[arg(short, long, allow_negative_numbers = true)]
        reference: f64,

        /// Value the sensor reported
        #[arg(short, long, allow_negative_numbers = true)]
        measured: f64,
    },

    /// Run the automatic calibration routine and follow its progress
    Auto {
        /// Sensor id
        sensor: String,
    },
}

pub async fn run(args: CalibrateArgs, engine: TelemetryEngine, output: OutputManager) -> Result<()> {
    match args.action {
        CalibrateAction::Status { sensor } => {
            let records = match sensor {
                Some(sensor) => vec![engine.get_calibration_status(&sensor)?],
                None => engine.list_calibrations(),
            };
            output.print_calibrations(&records)
        }
        CalibrateAction::Manual {
            sensor,
            reference,
            measured,
        } => {
            let record = engine.apply_manual_calibration(&sensor, reference, measured)?;
            output.print_calibrations(&[record])
        }
        CalibrateAction::Auto { sensor } => {
            let record = run_automatic(&engine, &sensor, &output).await?;
            output.print_calibrations(&[record])
        }
    }
}

async fn run_automatic(engine: &TelemetryEngine, sensor: &str, output: &OutputManager) -> Result<CalibrationRecord> {
    let mut events = engine.subscribe();
    engine.start_calibration(sensor)?;

    let bar = output.create_progress_bar(100, &format!("Calibrating {}", sensor));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                bar.abandon_with_message("cancelled");
                return Err(CliError::Cancelled);
            }
            event = events.recv() => match event {
                Ok(TelemetryEvent::CalibrationProgress { sensor_id, percent }) if sensor_id == sensor => {
                    bar.set_position(u64::from(percent));
                }
                Ok(TelemetryEvent::CalibrationFinished(record)) if record.sensor_id == sensor => {
                    bar.finish_with_message("done");
                    return Ok(record);
                }
                Ok(TelemetryEvent::CalibrationFailed { sensor_id, reason }) if sensor_id == sensor => {
                    bar.abandon_with_message("failed");
                    return Err(CliError::CalibrationFailed { sensor: sensor_id, reason });
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    return Err(CliError::InvalidArgument("event stream closed".to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use plantwatch_engine::calibration::CalibrationOutcome;
    use plantwatch_engine::error::{CalibrationError, CalibrationResult};
    use plantwatch_engine::{CalibrationRoutine, CalibrationStatus, Channel, EngineConfig};
    use tempfile::TempDir;

    use crate::output::OutputFormat;

    struct OfflineRoutine;

    #[async_trait]
    impl CalibrationRoutine for OfflineRoutine {
        async fn complete(&self, sensor: &Channel) -> CalibrationResult<CalibrationOutcome> {
            Err(CalibrationError::SensorFault {
                sensor: sensor.id.clone(),
                reason: "probe offline".to_string(),
            })
        }
    }

    fn engine(dir: &TempDir, routine: Option<Arc<dyn CalibrationRoutine>>) -> TelemetryEngine {
        let mut config = EngineConfig::default();
        config.persistence.state_dir = dir.path().to_path_buf();
        config.metrics.enabled = false;
        config.calibration.step_interval_ms = 1;
        let builder = TelemetryEngine::builder(config);
        match routine {
            Some(routine) => builder.calibration_routine(routine).build().unwrap(),
            None => builder.build().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_auto_calibration_reports_completion() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, None);
        let output = OutputManager::new(OutputFormat::Raw, false);

        let record = run_automatic(&engine, "oxygen_level", &output).await.unwrap();
        assert_eq!(record.status, CalibrationStatus::Good);
        assert_eq!(record.drift_percent, 0.1);
    }

    #[tokio::test]
    async fn test_failed_auto_calibration_is_an_error() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Some(Arc::new(OfflineRoutine)));
        let output = OutputManager::new(OutputFormat::Raw, false);

        let error = run_automatic(&engine, "oxygen_level", &output).await.unwrap_err();
        assert_eq!(error.exit_code(), 10);
        match error {
            CliError::CalibrationFailed { sensor, reason } => {
                assert_eq!(sensor, "oxygen_level");
                assert!(reason.contains("probe offline"));
            }
            other => panic!("expected a calibration failure, got {}", other),
        }
        assert!(engine.get_calibration_status("oxygen_level").unwrap().last_calibrated_at.is_none());
    }
}

//! Calibration tracker
//!
//! Each sensor moves through `Good | Warning | Error --start--> Calibrating`.
//! An automatic calibration runs as its own tokio task, stepping its progress
//! from 0 to 100 and applying the routine's result in one atomic update at
//! completion. Abandoned calibrations (shutdown, cancellation) apply nothing,
//! so the sensor's prior record stands.
//!
//! A manual calibration takes a `(reference, measured)` pair and re-derives
//! the status from the resulting drift, which may land on any status.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelRegistry};
use crate::error::{CalibrationError, CalibrationResult};
use crate::event_bus::{EventBus, TelemetryEvent};
use crate::locks;
use crate::metrics::MetricsCollector;
use crate::model::Severity;

/// Drift below this percentage is `good`
pub const GOOD_DRIFT_LIMIT: f64 = 0.5;

/// Drift below this percentage (and not good) is `warning`
pub const WARNING_DRIFT_LIMIT: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationStatus {
    Good,
    Warning,
    Error,
}

impl CalibrationStatus {
    pub fn from_drift(drift_percent: f64) -> Self {
        if drift_percent < GOOD_DRIFT_LIMIT {
            CalibrationStatus::Good
        } else if drift_percent < WARNING_DRIFT_LIMIT {
            CalibrationStatus::Warning
        } else {
            CalibrationStatus::Error
        }
    }

    /// Position of this status on the shared severity scale
    pub fn severity(&self) -> Severity {
        match self {
            CalibrationStatus::Good => Severity::Low,
            CalibrationStatus::Warning => Severity::Medium,
            CalibrationStatus::Error => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationStatus::Good => "good",
            CalibrationStatus::Warning => "warning",
            CalibrationStatus::Error => "error",
        }
    }
}

/// Current calibration bookkeeping for one sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub sensor_id: String,
    pub status: CalibrationStatus,
    pub last_calibrated_at: Option<DateTime<Utc>>,
    pub accuracy_percent: f64,
    pub drift_percent: f64,
}

impl CalibrationRecord {
    fn initial(sensor_id: &str) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            status: CalibrationStatus::Good,
            last_calibrated_at: None,
            accuracy_percent: 100.0,
            drift_percent: 0.0,
        }
    }
}

/// State machine position of a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CalibrationState {
    Good,
    Warning,
    Error,
    Calibrating { progress: u8 },
}

impl From<CalibrationStatus> for CalibrationState {
    fn from(status: CalibrationStatus) -> Self {
        match status {
            CalibrationStatus::Good => CalibrationState::Good,
            CalibrationStatus::Warning => CalibrationState::Warning,
            CalibrationStatus::Error => CalibrationState::Error,
        }
    }
}

/// Figures produced by a completed calibration run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationOutcome {
    pub accuracy_percent: f64,
    pub drift_percent: f64,
}

/// The work performed once a calibration reaches 100%
///
/// Hardware-backed routines can fail (e.g. a sensor fault); the tracker then
/// keeps the sensor's prior record.
#[async_trait]
pub trait CalibrationRoutine: Send + Sync {
    async fn complete(&self, sensor: &Channel) -> CalibrationResult<CalibrationOutcome>;
}

/// Routine that always succeeds with the reference figures
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceRoutine;

#[async_trait]
impl CalibrationRoutine for ReferenceRoutine {
    async fn complete(&self, _sensor: &Channel) -> CalibrationResult<CalibrationOutcome> {
        Ok(CalibrationOutcome {
            accuracy_percent: 99.5,
            drift_percent: 0.1,
        })
    }
}

/// Pacing of automatic calibrations
#[derive(Debug, Clone, Copy)]
pub struct CalibrationPacing {
    pub step_percent: u8,
    pub step_interval: Duration,
}

impl Default for CalibrationPacing {
    fn default() -> Self {
        Self {
            step_percent: 10,
            step_interval: Duration::from_millis(500),
        }
    }
}

struct InFlight {
    generation: u64,
    progress: u8,
    cancel: CancellationToken,
}

struct SensorEntry {
    record: CalibrationRecord,
    in_flight: Option<InFlight>,
}

struct TrackerInner {
    registry: Arc<ChannelRegistry>,
    sensors: RwLock<BTreeMap<String, SensorEntry>>,
    routine: Arc<dyn CalibrationRoutine>,
    bus: EventBus,
    metrics: Arc<MetricsCollector>,
    pacing: CalibrationPacing,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct CalibrationTracker {
    inner: Arc<TrackerInner>,
}

impl CalibrationTracker {
    /// Track every channel in the registry, each starting from a clean record
    pub fn new(
        registry: Arc<ChannelRegistry>,
        routine: Arc<dyn CalibrationRoutine>,
        pacing: CalibrationPacing,
        bus: EventBus,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let sensors = registry
            .iter()
            .map(|channel| {
                (
                    channel.id.clone(),
                    SensorEntry {
                        record: CalibrationRecord::initial(&channel.id),
                        in_flight: None,
                    },
                )
            })
            .collect();

        let pacing = CalibrationPacing {
            step_percent: pacing.step_percent.clamp(1, 100),
            step_interval: pacing.step_interval,
        };

        Self {
            inner: Arc::new(TrackerInner {
                registry,
                sensors: RwLock::new(sensors),
                routine,
                bus,
                metrics,
                pacing,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Begin an automatic calibration; must be called within a tokio runtime
    pub fn start_calibration(&self, sensor_id: &str) -> CalibrationResult<()> {
        let channel = self
            .inner
            .registry
            .get(sensor_id)
            .cloned()
            .ok_or_else(|| CalibrationError::UnknownSensor {
                sensor: sensor_id.to_string(),
            })?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        {
            let mut sensors = locks::write(&self.inner.sensors);
            let entry = sensors.get_mut(sensor_id).ok_or_else(|| CalibrationError::UnknownSensor {
                sensor: sensor_id.to_string(),
            })?;
            if entry.in_flight.is_some() {
                return Err(CalibrationError::CalibrationInProgress {
                    sensor: sensor_id.to_string(),
                });
            }
            entry.in_flight = Some(InFlight {
                generation,
                progress: 0,
                cancel: cancel.clone(),
            });
        }

        tracing::info!(sensor = sensor_id, "Calibration started");
        self.inner.bus.publish(TelemetryEvent::CalibrationProgress {
            sensor_id: sensor_id.to_string(),
            percent: 0,
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run(channel, generation, cancel).await;
        });

        Ok(())
    }

    /// Record a calibration against a known reference
    pub fn apply_manual_calibration(
        &self,
        sensor_id: &str,
        reference_value: f64,
        measured_value: f64,
    ) -> CalibrationResult<CalibrationRecord> {
        if reference_value == 0.0 || !reference_value.is_finite() {
            return Err(CalibrationError::InvalidReference {
                sensor: sensor_id.to_string(),
                reference: reference_value,
            });
        }
        if !measured_value.is_finite() {
            return Err(CalibrationError::SensorFault {
                sensor: sensor_id.to_string(),
                reason: format!("non-finite measurement {}", measured_value),
            });
        }

        let drift_percent = (measured_value - reference_value).abs() * 100.0 / reference_value.abs();
        let record = {
            let mut sensors = locks::write(&self.inner.sensors);
            let entry = sensors.get_mut(sensor_id).ok_or_else(|| CalibrationError::UnknownSensor {
                sensor: sensor_id.to_string(),
            })?;
            if entry.in_flight.is_some() {
                return Err(CalibrationError::CalibrationInProgress {
                    sensor: sensor_id.to_string(),
                });
            }

            entry.record = CalibrationRecord {
                sensor_id: sensor_id.to_string(),
                status: CalibrationStatus::from_drift(drift_percent),
                last_calibrated_at: Some(Utc::now()),
                accuracy_percent: (100.0 - drift_percent).max(0.0),
                drift_percent,
            };
            entry.record.clone()
        };

        tracing::info!(
            sensor = sensor_id,
            drift = record.drift_percent,
            status = record.status.as_str(),
            "Manual calibration applied"
        );
        self.inner.bus.publish(TelemetryEvent::CalibrationFinished(record.clone()));
        Ok(record)
    }

    pub fn get_calibration_status(&self, sensor_id: &str) -> CalibrationResult<CalibrationRecord> {
        locks::read(&self.inner.sensors)
            .get(sensor_id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| CalibrationError::UnknownSensor {
                sensor: sensor_id.to_string(),
            })
    }

    pub fn state(&self, sensor_id: &str) -> CalibrationResult<CalibrationState> {
        locks::read(&self.inner.sensors)
            .get(sensor_id)
            .map(|entry| match &entry.in_flight {
                Some(flight) => CalibrationState::Calibrating {
                    progress: flight.progress,
                },
                None => entry.record.status.into(),
            })
            .ok_or_else(|| CalibrationError::UnknownSensor {
                sensor: sensor_id.to_string(),
            })
    }

    /// Progress of an in-flight calibration, `None` when idle
    pub fn progress(&self, sensor_id: &str) -> Option<u8> {
        locks::read(&self.inner.sensors)
            .get(sensor_id)
            .and_then(|entry| entry.in_flight.as_ref().map(|flight| flight.progress))
    }

    pub fn list_calibrations(&self) -> Vec<CalibrationRecord> {
        locks::read(&self.inner.sensors)
            .values()
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn is_calibrating(&self, sensor_id: &str) -> bool {
        self.progress(sensor_id).is_some()
    }

    /// Abandon every in-flight calibration without applying it
    pub fn abandon_all(&self) -> usize {
        let mut sensors = locks::write(&self.inner.sensors);
        let mut abandoned = 0;
        for (sensor_id, entry) in sensors.iter_mut() {
            if let Some(flight) = entry.in_flight.take() {
                flight.cancel.cancel();
                tracing::info!(sensor = %sensor_id, progress = flight.progress, "Calibration abandoned");
                abandoned += 1;
            }
        }
        abandoned
    }
}

impl TrackerInner {
    async fn run(&self, channel: Channel, generation: u64, cancel: CancellationToken) {
        let sensor_id = channel.id.clone();
        let mut progress: u8 = 0;

        while progress < 100 {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.pacing.step_interval) => {}
            }

            progress = progress.saturating_add(self.pacing.step_percent).min(100);
            if !self.set_progress(&sensor_id, generation, progress) {
                return;
            }
            tracing::debug!(sensor = %sensor_id, progress, "Calibration progress");
            self.bus.publish(TelemetryEvent::CalibrationProgress {
                sensor_id: sensor_id.clone(),
                percent: progress,
            });
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = self.routine.complete(&channel) => outcome,
        };

        match outcome {
            Ok(outcome) => self.finish(&sensor_id, generation, outcome),
            Err(e) => self.fail(&sensor_id, generation, e),
        }
    }

    /// Returns false when this run is no longer the sensor's active calibration
    fn set_progress(&self, sensor_id: &str, generation: u64, progress: u8) -> bool {
        let mut sensors = locks::write(&self.sensors);
        match sensors.get_mut(sensor_id).and_then(|entry| entry.in_flight.as_mut()) {
            Some(flight) if flight.generation == generation => {
                flight.progress = progress;
                true
            }
            _ => false,
        }
    }

    fn finish(&self, sensor_id: &str, generation: u64, outcome: CalibrationOutcome) {
        let record = {
            let mut sensors = locks::write(&self.sensors);
            let Some(entry) = sensors.get_mut(sensor_id) else {
                return;
            };
            if !entry.in_flight.as_ref().is_some_and(|flight| flight.generation == generation) {
                return;
            }

            entry.in_flight = None;
            entry.record = CalibrationRecord {
                sensor_id: sensor_id.to_string(),
                status: CalibrationStatus::from_drift(outcome.drift_percent),
                last_calibrated_at: Some(Utc::now()),
                accuracy_percent: outcome.accuracy_percent,
                drift_percent: outcome.drift_percent,
            };
            entry.record.clone()
        };

        tracing::info!(sensor = sensor_id, status = record.status.as_str(), "Calibration completed");
        self.metrics.record_calibration(true);
        self.bus.publish(TelemetryEvent::CalibrationFinished(record));
    }

    fn fail(&self, sensor_id: &str, generation: u64, error: CalibrationError) {
        {
            let mut sensors = locks::write(&self.sensors);
            let Some(entry) = sensors.get_mut(sensor_id) else {
                return;
            };
            if !entry.in_flight.as_ref().is_some_and(|flight| flight.generation == generation) {
                return;
            }
            entry.in_flight = None;
        }

        tracing::warn!(sensor = sensor_id, error = %error, "Calibration failed, keeping previous record");
        self.metrics.record_calibration(false);
        self.bus.publish(TelemetryEvent::CalibrationFailed {
            sensor_id: sensor_id.to_string(),
            reason: error.to_string(),
        });
    }
}

//! Plantwatch telemetry engine library
//!
//! This library provides the core of the Plantwatch plant monitor: bounded
//! per-channel ring buffers, threshold and correlation anomaly detection,
//! sensor calibration tracking and time-scaled replay of buffered history.

pub mod alerts;
pub mod buffer;
pub mod calibration;
pub mod channel;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod export;
pub mod external;
pub mod ingestion;
pub mod metrics;
pub mod model;
pub mod persistence;
pub mod replay;
pub mod rules;

mod locks;

// Re-export commonly used types
pub use alerts::{AlertFilter, AlertLog, AlertRecord};
pub use buffer::BufferStore;
pub use calibration::{CalibrationRecord, CalibrationRoutine, CalibrationState, CalibrationStatus, CalibrationTracker};
pub use channel::{Baseline, Channel, ChannelRegistry, ValueRange};
pub use config::EngineConfig;
pub use detector::AnomalyDetector;
pub use engine::{EngineBuilder, ServiceState, ServiceStatus, TelemetryEngine};
pub use error::{EngineError, Result};
pub use event_bus::{EventBus, TelemetryEvent};
pub use export::ExportFormat;
pub use ingestion::{IngestOutcome, IngestionPump, ScriptedSource, SimulatedSource, Source};
pub use metrics::{MetricsCollector, QualityCounters};
pub use model::{AlertStatus, AnomalyEvent, AnomalyKind, Sample, Severity};
pub use replay::{Frame, LookupMode, PlaybackState, Position, ReplayController};
pub use rules::{Condition, RuleDraft, RuleEngine, RuleId, ThresholdRule};

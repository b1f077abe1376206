//! End-to-end tests for the Plantwatch telemetry engine

use tempfile::TempDir;
use tokio::sync::broadcast::error::TryRecvError;

use plantwatch_engine::error::{BufferError, CalibrationError};
use plantwatch_engine::{
    AlertFilter, CalibrationStatus, Channel, Condition, EngineConfig, EngineError, ExportFormat, PlaybackState,
    RuleDraft, Sample, ScriptedSource, Severity, TelemetryEngine, TelemetryEvent,
};

fn pressure_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.channels = vec![Channel::new("pressure", "bar", 0.0, 10.0).with_nominal(3.0)];
    config.persistence.state_dir = dir.path().to_path_buf();
    config.metrics.enabled = false;
    config
}

fn kiln_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.persistence.state_dir = dir.path().to_path_buf();
    config.metrics.enabled = false;
    config
}

#[tokio::test]
async fn test_below_threshold_breaches() {
    let dir = TempDir::new().unwrap();
    let engine = TelemetryEngine::new(pressure_config(&dir)).unwrap();
    engine
        .add_rule(RuleDraft::new("pressure", Condition::Below, 2.5, Severity::Medium))
        .unwrap();

    let mut events = engine.subscribe();
    let mut breaches = Vec::new();
    for (ts, value) in [(1_000, 3.0), (2_000, 2.0), (3_000, 1.8)] {
        let outcome = engine.ingest(Sample::new("pressure", ts, value));
        assert!(outcome.is_accepted());
        breaches.extend(outcome.anomalies().to_vec());
    }

    assert_eq!(breaches.len(), 2);
    assert!(breaches.iter().all(|e| e.severity == Severity::Medium));
    assert_eq!(breaches[0].timestamp_ms, 2_000);
    assert_eq!(breaches[1].timestamp_ms, 3_000);
    assert_eq!(breaches[0].expected_range, (2.5, 10.0));

    let mut published = 0;
    loop {
        match events.try_recv() {
            Ok(TelemetryEvent::Anomaly(_)) => published += 1,
            Ok(_) => {}
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("unexpected receive error: {e}"),
        }
    }
    assert_eq!(published, 2);
    assert_eq!(engine.list_active_alerts().len(), 2);

    let window = engine.get_window("pressure", 0, 10_000).unwrap();
    assert_eq!(window.len(), 3);
    assert_eq!(engine.get_latest("pressure").unwrap().unwrap().value, 1.8);
}

#[tokio::test]
async fn test_disabled_rule_is_silent() {
    let dir = TempDir::new().unwrap();
    let engine = TelemetryEngine::new(pressure_config(&dir)).unwrap();
    let id = engine
        .add_rule(RuleDraft::new("pressure", Condition::Below, 2.5, Severity::Medium))
        .unwrap();
    engine.set_rule_enabled(id, false).unwrap();

    let outcome = engine.ingest(Sample::new("pressure", 1_000, 1.0));
    assert!(outcome.anomalies().is_empty());

    engine.set_rule_enabled(id, true).unwrap();
    let outcome = engine.ingest(Sample::new("pressure", 2_000, 1.0));
    assert_eq!(outcome.anomalies().len(), 1);
}

#[tokio::test]
async fn test_data_quality_rejects() {
    let dir = TempDir::new().unwrap();
    let engine = TelemetryEngine::new(pressure_config(&dir)).unwrap();

    assert!(engine.ingest(Sample::new("pressure", 5_000, 3.0)).is_accepted());
    assert!(!engine.ingest(Sample::new("pressure", 4_000, 3.0)).is_accepted());
    assert!(!engine.ingest(Sample::new("humidity", 6_000, 3.0)).is_accepted());

    // stored but flagged
    assert!(engine.ingest(Sample::new("pressure", 7_000, 12.0)).is_accepted());

    let counters = engine.quality_counters();
    assert_eq!(counters.samples_accepted, 2);
    assert_eq!(counters.out_of_order, 1);
    assert_eq!(counters.unknown_channel, 1);
    assert_eq!(counters.out_of_range, 1);

    assert!(matches!(
        engine.get_latest("humidity"),
        Err(EngineError::Buffer(BufferError::UnknownChannel { .. }))
    ));
}

#[tokio::test]
async fn test_replay_advances_by_ticks() {
    let dir = TempDir::new().unwrap();
    let engine = TelemetryEngine::new(pressure_config(&dir)).unwrap();
    for i in 0..20 {
        engine.ingest(Sample::new("pressure", 10_000 + i * 500, 3.0 + i as f64 * 0.1));
    }

    engine.open_replay(10_000, 19_500).unwrap();
    engine.play().unwrap();
    for _ in 0..5 {
        engine.replay().tick().unwrap();
    }
    let position = engine.current_position().unwrap();
    assert_eq!(position.cursor_ms, 500);
    assert_eq!(position.timestamp_ms, 10_500);

    engine.set_speed(2.0).unwrap();
    let frame = engine.replay().tick().unwrap().unwrap();
    assert_eq!(frame.cursor_ms, 700);
    assert_eq!(frame.samples.len(), 1);
    assert_eq!(frame.samples[0].timestamp_ms, 10_500);

    engine.pause().unwrap();
    assert!(engine.replay().tick().unwrap().is_none());

    let position = engine.seek(100_000).unwrap();
    assert_eq!(position.cursor_ms, 9_500);
    assert_eq!(position.state, PlaybackState::Paused);

    engine.resume().unwrap();
    engine.replay().tick().unwrap();
    assert_eq!(engine.current_position().unwrap().state, PlaybackState::Stopped);
}

#[tokio::test]
async fn test_manual_calibration_drift() {
    let dir = TempDir::new().unwrap();
    let engine = TelemetryEngine::new(kiln_config(&dir)).unwrap();

    let record = engine
        .apply_manual_calibration("kiln_temperature", 100.0, 103.0)
        .unwrap();
    assert!((record.drift_percent - 3.0).abs() < 1e-9);
    assert_eq!(record.status, CalibrationStatus::Error);
    assert!(record.last_calibrated_at.is_some());

    let stored = engine.get_calibration_status("kiln_temperature").unwrap();
    assert_eq!(stored, record);

    assert!(matches!(
        engine.apply_manual_calibration("kiln_temperature", 0.0, 1.0),
        Err(EngineError::Calibration(CalibrationError::InvalidReference { .. }))
    ));
    assert!(matches!(
        engine.start_calibration("humidity"),
        Err(EngineError::Calibration(CalibrationError::UnknownSensor { .. }))
    ));
}

#[tokio::test]
async fn test_rules_persist_across_rebuild() {
    let dir = TempDir::new().unwrap();
    {
        let engine = TelemetryEngine::new(pressure_config(&dir)).unwrap();
        engine
            .add_rule(
                RuleDraft::new("pressure", Condition::OutsideRange, 1.0, Severity::High)
                    .with_max(8.0)
                    .with_description("Line pressure envelope"),
            )
            .unwrap();
        let doomed = engine
            .add_rule(RuleDraft::new("pressure", Condition::Above, 9.0, Severity::Critical))
            .unwrap();
        engine.remove_rule(doomed).unwrap();
    }

    let engine = TelemetryEngine::new(pressure_config(&dir)).unwrap();
    let rules = engine.list_rules();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].condition, Condition::OutsideRange);
    assert_eq!(rules[0].max_value, Some(8.0));

    let outcome = engine.ingest(Sample::new("pressure", 1_000, 9.5));
    assert_eq!(outcome.anomalies().len(), 1);
    assert_eq!(outcome.anomalies()[0].severity, Severity::High);
}

#[tokio::test]
async fn test_scripted_stream_and_export() {
    let dir = TempDir::new().unwrap();
    let source = ScriptedSource::new(vec![
        Sample::new("pressure", 1_000, 3.0),
        Sample::new("pressure", 2_000, 2.0),
    ]);
    let engine = TelemetryEngine::builder(pressure_config(&dir))
        .source(Box::new(source))
        .build()
        .unwrap();
    engine
        .add_rule(RuleDraft::new("pressure", Condition::Below, 2.5, Severity::Low))
        .unwrap();

    assert_eq!(engine.tick().await, 1);
    assert_eq!(engine.tick().await, 1);
    assert_eq!(engine.tick().await, 0);

    let alerts = engine.query_alerts(&AlertFilter {
        min_severity: Some(Severity::Low),
        ..AlertFilter::default()
    });
    assert_eq!(alerts.len(), 1);

    let csv = engine
        .export_window(&["pressure".to_string()], 0, 5_000, ExportFormat::Csv)
        .unwrap();
    let text = String::from_utf8(csv).unwrap();
    assert_eq!(text.lines().count(), 3);
}

//! Telemetry engine service
//!
//! Owns every component of the core and exposes the read, rule, calibration,
//! replay and export APIs used by the presentation layer. The engine has an
//! explicit lifecycle: `start()` launches the ingestion pump and the replay
//! scheduler, `stop()` cancels both and abandons in-flight calibrations.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerts::{AlertFilter, AlertLog, AlertRecord};
use crate::buffer::{BufferStats, BufferStore};
use crate::calibration::{CalibrationRecord, CalibrationRoutine, CalibrationState, CalibrationTracker, ReferenceRoutine};
use crate::channel::ChannelRegistry;
use crate::config::{EngineConfig, MAX_BUFFER_CAPACITY, MIN_BUFFER_CAPACITY};
use crate::detector::AnomalyDetector;
use crate::error::{EngineError, Result};
use crate::event_bus::{EventBus, TelemetryEvent};
use crate::export::{self, ExportFormat};
use crate::external::{ExternalServices, ReportGenerator, ReportRequest, WarehouseClient, WarehouseQuery, WarehouseResponse};
use crate::ingestion::{IngestOutcome, IngestionPump, SimulatedSource, Source};
use crate::locks;
use crate::metrics::{MetricsCollector, QualityCounters};
use crate::model::{AlertStatus, AnomalyEvent, Sample};
use crate::persistence::RuleStore;
use crate::replay::{Position, ReplayController};
use crate::rules::{RuleDraft, RuleEngine, RuleId, ThresholdRule};

/// Service state
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub status: ServiceStatus,

    /// When the engine last entered `Running`
    pub started_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
}

/// Service status
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error(String),
}

/// Builder for [`TelemetryEngine`]; only the configuration is required
pub struct EngineBuilder {
    config: EngineConfig,
    source: Option<Box<dyn Source>>,
    routine: Option<Arc<dyn CalibrationRoutine>>,
    warehouse: Option<Arc<dyn WarehouseClient>>,
    reports: Option<Arc<dyn ReportGenerator>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            source: None,
            routine: None,
            warehouse: None,
            reports: None,
        }
    }

    /// Sample source; defaults to a simulated random walk
    pub fn source(mut self, source: Box<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn calibration_routine(mut self, routine: Arc<dyn CalibrationRoutine>) -> Self {
        self.routine = Some(routine);
        self
    }

    pub fn warehouse(mut self, client: Arc<dyn WarehouseClient>) -> Self {
        self.warehouse = Some(client);
        self
    }

    pub fn report_generator(mut self, generator: Arc<dyn ReportGenerator>) -> Self {
        self.reports = Some(generator);
        self
    }

    pub fn build(self) -> Result<TelemetryEngine> {
        TelemetryEngine::assemble(self)
    }
}

struct ReplayLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct TelemetryEngine {
    config: EngineConfig,
    registry: Arc<ChannelRegistry>,
    buffers: Arc<BufferStore>,
    rules: Arc<RuleEngine>,
    rule_store: RuleStore,
    alerts: Arc<AlertLog>,
    calibration: CalibrationTracker,
    replay: Arc<ReplayController>,
    pump: Arc<IngestionPump>,
    external: ExternalServices,
    bus: EventBus,
    metrics: Arc<MetricsCollector>,
    state: Arc<RwLock<ServiceState>>,
    replay_loop: Mutex<Option<ReplayLoop>>,
}

impl TelemetryEngine {
    /// Create an engine with the default simulated source
    pub fn new(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    fn assemble(builder: EngineBuilder) -> Result<Self> {
        tracing::info!("Initializing Plantwatch telemetry engine");
        let config = builder.config;
        config.validate()?;

        let registry = Arc::new(config.registry()?);
        let metrics = Arc::new(MetricsCollector::new(config.metrics.enabled));
        let bus = EventBus::new(config.detection.event_bus_capacity);

        let buffers = Arc::new(BufferStore::new(
            Arc::clone(&registry),
            config.buffer.default_capacity,
            &config.buffer.capacity_overrides,
            config.retention_ms(),
        )?);

        let rule_store = RuleStore::new(config.rules_path());
        let persisted = rule_store.load()?;
        let rules = Arc::new(RuleEngine::with_rules(Arc::clone(&registry), persisted));

        let detector = Arc::new(
            AnomalyDetector::new(Arc::clone(&buffers), Arc::clone(&rules))
                .with_correlation_severity(config.detection.correlation_severity),
        );
        let alerts = Arc::new(AlertLog::new(config.detection.alert_log_capacity).with_retention(config.retention_ms()));

        let calibration = CalibrationTracker::new(
            Arc::clone(&registry),
            builder.routine.unwrap_or_else(|| Arc::new(ReferenceRoutine)),
            config.calibration_pacing(),
            bus.clone(),
            Arc::clone(&metrics),
        );

        let replay = Arc::new(ReplayController::new(
            Arc::clone(&buffers),
            config.replay_settings(),
            bus.clone(),
        ));

        let source = builder
            .source
            .unwrap_or_else(|| Box::new(SimulatedSource::from_entropy()));
        let pump = Arc::new(IngestionPump::new(
            Arc::clone(&buffers),
            detector,
            Arc::clone(&alerts),
            bus.clone(),
            Arc::clone(&metrics),
            source,
            config.pump_settings(),
        ));

        let mut external = ExternalServices::new(config.call_policy(), Arc::clone(&metrics));
        let warehouse = match builder.warehouse {
            Some(warehouse) => Some(warehouse),
            None => configured_warehouse(&config)?,
        };
        if let Some(warehouse) = warehouse {
            external = external.with_warehouse(warehouse);
        }
        if let Some(reports) = builder.reports {
            external = external.with_report_generator(reports);
        }

        let state = Arc::new(RwLock::new(ServiceState {
            status: ServiceStatus::Starting,
            started_at: None,
            last_error: None,
        }));

        tracing::info!(
            channels = registry.len(),
            rules = rules.len(),
            "Plantwatch telemetry engine initialized"
        );

        Ok(Self {
            config,
            registry,
            buffers,
            rules,
            rule_store,
            alerts,
            calibration,
            replay,
            pump,
            external,
            bus,
            metrics,
            state,
            replay_loop: Mutex::new(None),
        })
    }

    // Lifecycle

    /// Start ingestion and the replay scheduler
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if matches!(state.status, ServiceStatus::Running | ServiceStatus::Stopping) {
                return Err(EngineError::Lifecycle(format!(
                    "cannot start engine while {:?}",
                    state.status
                )));
            }
            state.status = ServiceStatus::Starting;
        }

        tracing::info!("Starting Plantwatch telemetry engine");
        if let Err(e) = self.pump.start() {
            let mut state = self.state.write().await;
            state.status = ServiceStatus::Error(e.to_string());
            state.last_error = Some(e.to_string());
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&self.replay).run(cancel.clone()));
        *locks::lock(&self.replay_loop) = Some(ReplayLoop { cancel, handle });

        let mut state = self.state.write().await;
        state.status = ServiceStatus::Running;
        state.started_at = Some(Utc::now());
        tracing::info!("Plantwatch telemetry engine started");
        Ok(())
    }

    /// Stop ingestion and replay; in-flight calibrations are abandoned
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.status == ServiceStatus::Stopped {
                return Ok(());
            }
            state.status = ServiceStatus::Stopping;
        }
        tracing::info!("Stopping Plantwatch telemetry engine");

        self.pump.stop().await;

        let replay_loop = locks::lock(&self.replay_loop).take();
        if let Some(replay_loop) = replay_loop {
            replay_loop.cancel.cancel();
            if let Err(e) = replay_loop.handle.await {
                tracing::error!("Replay loop failed: {}", e);
            }
        }

        let abandoned = self.calibration.abandon_all();
        if abandoned > 0 {
            tracing::warn!(abandoned, "Abandoned in-flight calibrations on shutdown");
        }

        self.state.write().await.status = ServiceStatus::Stopped;
        tracing::info!("Plantwatch telemetry engine stopped");
        Ok(())
    }

    pub async fn get_status(&self) -> ServiceState {
        self.state.read().await.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Subscribe to samples, anomalies, calibration and replay events
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.bus.subscribe()
    }

    // Presentation read API

    pub fn get_latest(&self, channel_id: &str) -> Result<Option<Sample>> {
        Ok(self.buffers.latest(channel_id)?)
    }

    pub fn get_window(&self, channel_id: &str, from_ms: i64, to_ms: i64) -> Result<Vec<Sample>> {
        Ok(self.buffers.window(channel_id, from_ms, to_ms)?)
    }

    pub fn list_active_alerts(&self) -> Vec<AnomalyEvent> {
        self.alerts.active()
    }

    pub fn query_alerts(&self, filter: &AlertFilter) -> Vec<AlertRecord> {
        self.alerts.query(filter)
    }

    pub fn list_rules(&self) -> Vec<ThresholdRule> {
        self.rules.list()
    }

    pub fn get_rule(&self, id: RuleId) -> Option<ThresholdRule> {
        self.rules.get(id)
    }

    pub fn rules_for(&self, channel_id: &str) -> Vec<ThresholdRule> {
        self.rules.rules_for(channel_id)
    }

    /// Earliest and latest buffered timestamps across all channels
    pub fn time_span(&self) -> Option<(i64, i64)> {
        self.buffers.time_span()
    }

    pub fn buffer_stats(&self, channel_id: &str) -> Result<BufferStats> {
        Ok(self.buffers.stats(channel_id)?)
    }

    // Alert handling

    pub fn acknowledge_alert(&self, event_id: &str) -> Result<()> {
        self.set_alert_status(event_id, AlertStatus::Acknowledged)
    }

    pub fn investigate_alert(&self, event_id: &str) -> Result<()> {
        self.set_alert_status(event_id, AlertStatus::Investigating)
    }

    pub fn resolve_alert(&self, event_id: &str) -> Result<()> {
        self.set_alert_status(event_id, AlertStatus::Resolved)
    }

    fn set_alert_status(&self, event_id: &str, status: AlertStatus) -> Result<()> {
        if self.alerts.set_status(event_id, status) {
            Ok(())
        } else {
            Err(EngineError::Generic(format!("Unknown alert: {}", event_id)))
        }
    }

    // Rule management API
    //
    // A mutation is undone in memory when the rule set cannot be saved; the
    // live rules always equal what a restart would load.

    pub fn add_rule(&self, draft: RuleDraft) -> Result<RuleId> {
        let id = self.rules.add_rule(draft)?;
        if let Err(e) = self.persist_rules() {
            self.rules.discard(id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn update_rule(&self, id: RuleId, draft: RuleDraft) -> Result<ThresholdRule> {
        let previous = self.rules.get(id);
        let rule = self.rules.update_rule(id, draft)?;
        if let Err(e) = self.persist_rules() {
            if let Some(previous) = previous {
                self.rules.restore(previous);
            }
            return Err(e);
        }
        Ok(rule)
    }

    pub fn remove_rule(&self, id: RuleId) -> Result<ThresholdRule> {
        let rule = self.rules.remove_rule(id)?;
        if let Err(e) = self.persist_rules() {
            self.rules.restore(rule);
            return Err(e);
        }
        Ok(rule)
    }

    pub fn set_rule_enabled(&self, id: RuleId, enabled: bool) -> Result<()> {
        let previous = self.rules.get(id).map(|rule| rule.enabled);
        self.rules.set_enabled(id, enabled)?;
        if let Err(e) = self.persist_rules() {
            if let Some(previous) = previous {
                self.rules.set_enabled(id, previous)?;
            }
            return Err(e);
        }
        Ok(())
    }

    fn persist_rules(&self) -> Result<()> {
        self.rule_store.save(&self.rules.list()).map_err(|e| {
            tracing::error!("Failed to persist rules: {}", e);
            EngineError::from(e)
        })
    }

    // Ingestion and streaming controls

    /// Push one externally produced sample through the pipeline
    pub fn ingest(&self, sample: Sample) -> IngestOutcome {
        self.pump.ingest(sample)
    }

    /// Run a single ingestion tick outside the scheduler
    pub async fn tick(&self) -> usize {
        self.pump.tick().await
    }

    /// Resize one channel's buffer, clamped to the supported range
    pub fn set_capacity(&self, channel_id: &str, capacity: usize) -> Result<usize> {
        let capacity = capacity.clamp(MIN_BUFFER_CAPACITY, MAX_BUFFER_CAPACITY);
        let evicted = self.buffers.set_capacity(channel_id, capacity)?;
        if evicted > 0 {
            tracing::info!(channel = channel_id, evicted, "Buffer shrunk");
        }
        Ok(capacity)
    }

    pub fn set_sampling_interval(&self, ms: u64) -> u64 {
        self.pump.set_sampling_interval(ms)
    }

    pub fn sampling_interval_ms(&self) -> u64 {
        self.pump.sampling_interval_ms()
    }

    pub fn reset_buffers(&self) {
        self.buffers.reset_all();
        tracing::info!("All channel buffers cleared");
    }

    // Calibration API

    pub fn start_calibration(&self, sensor_id: &str) -> Result<()> {
        Ok(self.calibration.start_calibration(sensor_id)?)
    }

    pub fn apply_manual_calibration(&self, sensor_id: &str, reference: f64, measured: f64) -> Result<CalibrationRecord> {
        Ok(self.calibration.apply_manual_calibration(sensor_id, reference, measured)?)
    }

    pub fn get_calibration_status(&self, sensor_id: &str) -> Result<CalibrationRecord> {
        Ok(self.calibration.get_calibration_status(sensor_id)?)
    }

    pub fn calibration_state(&self, sensor_id: &str) -> Result<CalibrationState> {
        Ok(self.calibration.state(sensor_id)?)
    }

    pub fn list_calibrations(&self) -> Vec<CalibrationRecord> {
        self.calibration.list_calibrations()
    }

    // Replay API

    pub fn replay(&self) -> &ReplayController {
        &self.replay
    }

    pub fn open_replay(&self, start_ms: i64, end_ms: i64) -> Result<Position> {
        Ok(self.replay.open_session(start_ms, end_ms)?)
    }

    pub fn play(&self) -> Result<Position> {
        Ok(self.replay.play()?)
    }

    pub fn pause(&self) -> Result<Position> {
        Ok(self.replay.pause()?)
    }

    pub fn resume(&self) -> Result<Position> {
        Ok(self.replay.resume()?)
    }

    pub fn seek(&self, offset_ms: i64) -> Result<Position> {
        Ok(self.replay.seek(offset_ms)?)
    }

    pub fn set_speed(&self, multiplier: f64) -> Result<Position> {
        Ok(self.replay.set_speed(multiplier)?)
    }

    pub fn current_position(&self) -> Result<Position> {
        Ok(self.replay.current_position()?)
    }

    // Export and external collaborators

    pub fn export_window(&self, channel_ids: &[String], from_ms: i64, to_ms: i64, format: ExportFormat) -> Result<Vec<u8>> {
        export::export_window(&self.buffers, channel_ids, from_ms, to_ms, format)
    }

    pub async fn query_warehouse(&self, query: &WarehouseQuery) -> Result<WarehouseResponse> {
        Ok(self.external.query_warehouse(query).await?)
    }

    pub async fn generate_report(&self, request: &ReportRequest) -> Result<String> {
        Ok(self.external.generate_report(request).await?)
    }

    // Telemetry about telemetry

    pub fn quality_counters(&self) -> QualityCounters {
        self.metrics.snapshot()
    }

    pub fn export_metrics(&self, format: &str) -> Result<String> {
        self.metrics.export_metrics(format)
    }
}

#[cfg(feature = "warehouse-http")]
fn configured_warehouse(config: &EngineConfig) -> Result<Option<Arc<dyn WarehouseClient>>> {
    let Some(url) = &config.external.warehouse_url else {
        return Ok(None);
    };
    let client = crate::external::HttpWarehouseClient::new(url.as_str())?;
    tracing::info!("Analytics warehouse configured at {}", url);
    Ok(Some(Arc::new(client)))
}

#[cfg(not(feature = "warehouse-http"))]
fn configured_warehouse(config: &EngineConfig) -> Result<Option<Arc<dyn WarehouseClient>>> {
    if let Some(url) = &config.external.warehouse_url {
        tracing::warn!("warehouse_url {} ignored: built without the warehouse-http feature", url);
    }
    Ok(None)
}

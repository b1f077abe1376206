//! Ingestion pump
//!
//! Pulls one sample per channel from a [`Source`] on a fixed period and pushes
//! it through `buffer -> detector -> alert log -> bus`. Each tick completes
//! before the next is scheduled, so ticks never overlap. A bad sample is
//! counted and logged, never allowed to interrupt the stream.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::alerts::AlertLog;
use crate::buffer::BufferStore;
use crate::channel::Channel;
use crate::detector::AnomalyDetector;
use crate::error::{BufferError, EngineError, Result};
use crate::event_bus::{EventBus, TelemetryEvent};
use crate::locks;
use crate::metrics::MetricsCollector;
use crate::model::{now_millis, AnomalyEvent, ChannelId, Sample};

pub const MIN_SAMPLING_INTERVAL_MS: u64 = 500;
pub const MAX_SAMPLING_INTERVAL_MS: u64 = 10_000;

const RESTART_BACKOFF: Duration = Duration::from_secs(1);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(30);

/// Supplier of live readings
///
/// Returning `None` means the source has nothing for that channel this tick.
#[async_trait]
pub trait Source: Send {
    async fn next_sample(&mut self, channel: &Channel, now_ms: i64) -> Option<Sample>;
}

/// Mean-reverting random walk around each channel's nominal value
pub struct SimulatedSource {
    rng: StdRng,
    values: HashMap<ChannelId, f64>,
    volatility: f64,
}

impl SimulatedSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            values: HashMap::new(),
            volatility: 0.005,
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            values: HashMap::new(),
            volatility: 0.005,
        }
    }

    /// Step size as a fraction of the channel's valid span
    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility.abs();
        self
    }
}

#[async_trait]
impl Source for SimulatedSource {
    async fn next_sample(&mut self, channel: &Channel, now_ms: i64) -> Option<Sample> {
        let nominal = channel.nominal_value();
        let span = channel.valid_range.max - channel.valid_range.min;
        let current = *self.values.get(&channel.id).unwrap_or(&nominal);

        let step = self.rng.gen_range(-1.0..=1.0) * span * self.volatility;
        let reverted = current + step + (nominal - current) * 0.05;
        let next = reverted.clamp(channel.valid_range.min, channel.valid_range.max);

        self.values.insert(channel.id.clone(), next);
        Some(Sample::new(channel.id.clone(), now_ms, next))
    }
}

/// Replays a fixed list of samples, in order, per channel
#[derive(Debug, Default)]
pub struct ScriptedSource {
    queues: HashMap<ChannelId, VecDeque<Sample>>,
}

impl ScriptedSource {
    pub fn new(samples: impl IntoIterator<Item = Sample>) -> Self {
        let mut queues: HashMap<ChannelId, VecDeque<Sample>> = HashMap::new();
        for sample in samples {
            queues.entry(sample.channel_id.clone()).or_default().push_back(sample);
        }
        Self { queues }
    }

    pub fn remaining(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

#[async_trait]
impl Source for ScriptedSource {
    async fn next_sample(&mut self, channel: &Channel, _now_ms: i64) -> Option<Sample> {
        self.queues.get_mut(&channel.id)?.pop_front()
    }
}

/// What happened to one ingested sample
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted {
        flagged: bool,
        anomalies: Vec<AnomalyEvent>,
    },
    Rejected(BufferError),
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted { .. })
    }

    pub fn anomalies(&self) -> &[AnomalyEvent] {
        match self {
            IngestOutcome::Accepted { anomalies, .. } => anomalies,
            IngestOutcome::Rejected(_) => &[],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub sampling_interval_ms: u64,
    pub auto_restart: bool,
    pub publish_samples: bool,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 2_000,
            auto_restart: true,
            publish_samples: true,
        }
    }
}

pub fn clamp_sampling_interval(ms: u64) -> u64 {
    ms.clamp(MIN_SAMPLING_INTERVAL_MS, MAX_SAMPLING_INTERVAL_MS)
}

struct RunningPump {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct IngestionPump {
    buffers: Arc<BufferStore>,
    detector: Arc<AnomalyDetector>,
    alerts: Arc<AlertLog>,
    bus: EventBus,
    metrics: Arc<MetricsCollector>,
    source: tokio::sync::Mutex<Box<dyn Source>>,
    interval_ms: AtomicU64,
    auto_restart: bool,
    publish_samples: bool,
    running: Mutex<Option<RunningPump>>,
    restarts: AtomicU64,
}

impl IngestionPump {
    pub fn new(
        buffers: Arc<BufferStore>,
        detector: Arc<AnomalyDetector>,
        alerts: Arc<AlertLog>,
        bus: EventBus,
        metrics: Arc<MetricsCollector>,
        source: Box<dyn Source>,
        settings: PumpSettings,
    ) -> Self {
        Self {
            buffers,
            detector,
            alerts,
            bus,
            metrics,
            source: tokio::sync::Mutex::new(source),
            interval_ms: AtomicU64::new(clamp_sampling_interval(settings.sampling_interval_ms)),
            auto_restart: settings.auto_restart,
            publish_samples: settings.publish_samples,
            running: Mutex::new(None),
            restarts: AtomicU64::new(0),
        }
    }

    /// Push one sample through buffering and detection
    pub fn ingest(&self, sample: Sample) -> IngestOutcome {
        let appended = match self.buffers.append(sample.clone()) {
            Ok(appended) => appended,
            Err(e) => {
                tracing::warn!(channel = %sample.channel_id, ts = sample.timestamp_ms, error = %e, "Sample rejected");
                self.report_quality(&sample, &e);
                return IngestOutcome::Rejected(e);
            }
        };

        self.metrics.record_accepted(appended.evicted);
        if appended.flagged {
            if let Some(issue) = self.range_violation(&sample) {
                tracing::warn!(error = %issue, "Sample stored flagged");
                self.report_quality(&sample, &issue);
            }
        }
        if self.publish_samples {
            self.bus.publish(TelemetryEvent::Sample(sample.clone()));
        }

        let anomalies = self.detector.on_sample(&sample);
        if !anomalies.is_empty() {
            self.alerts.extend(anomalies.iter().cloned());
            for event in &anomalies {
                self.metrics.record_anomaly(event.kind);
                self.bus.publish(TelemetryEvent::Anomaly(event.clone()));
            }
        }

        IngestOutcome::Accepted {
            flagged: appended.flagged,
            anomalies,
        }
    }

    fn range_violation(&self, sample: &Sample) -> Option<BufferError> {
        let range = self.buffers.registry().get(&sample.channel_id)?.valid_range;
        (!range.contains(sample.value)).then(|| BufferError::OutOfRange {
            channel: sample.channel_id.clone(),
            value: sample.value,
            min: range.min,
            max: range.max,
        })
    }

    fn report_quality(&self, sample: &Sample, issue: &BufferError) {
        self.metrics.record_quality(issue.quality_label());
        self.bus.publish(TelemetryEvent::DataQuality {
            channel_id: sample.channel_id.clone(),
            timestamp_ms: sample.timestamp_ms,
            issue: issue.quality_label().to_string(),
        });
    }

    /// Pull and ingest one sample per channel; returns how many were accepted
    pub async fn tick(&self) -> usize {
        let now_ms = now_millis();
        let mut accepted = 0;
        {
            let mut source = self.source.lock().await;
            for channel in self.buffers.registry().iter() {
                if let Some(sample) = source.next_sample(channel, now_ms).await {
                    if self.ingest(sample).is_accepted() {
                        accepted += 1;
                    }
                }
            }
        }

        let buffered: usize = self
            .buffers
            .registry()
            .iter()
            .filter_map(|channel| self.buffers.len(&channel.id).ok())
            .sum();
        self.metrics.record_buffered(buffered);
        tracing::trace!(accepted, buffered, "Ingestion tick");
        accepted
    }

    pub fn sampling_interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::Relaxed)
    }

    /// Change the sampling period, clamped to 0.5 s..10 s; returns the applied value
    pub fn set_sampling_interval(&self, ms: u64) -> u64 {
        let applied = clamp_sampling_interval(ms);
        self.interval_ms.store(applied, Ordering::Relaxed);
        tracing::info!(requested = ms, applied, "Sampling interval changed");
        applied
    }

    pub fn is_running(&self) -> bool {
        locks::lock(&self.running)
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Start the periodic loop; must be called within a tokio runtime
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut running = locks::lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(EngineError::Lifecycle("ingestion pump already running".to_string()));
        }

        let cancel = CancellationToken::new();
        let pump = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { pump.supervise(token).await });

        *running = Some(RunningPump { cancel, handle });
        tracing::info!(interval_ms = self.sampling_interval_ms(), "Ingestion pump started");
        Ok(())
    }

    /// Stop the loop and wait for the in-progress tick to finish
    pub async fn stop(&self) {
        let running = locks::lock(&self.running).take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                tracing::error!("Ingestion pump task failed: {}", e);
            }
            tracing::info!("Ingestion pump stopped");
        }
    }

    /// Number of times the loop was restarted after a crash
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    async fn supervise(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = RESTART_BACKOFF;
        loop {
            let pump = Arc::clone(&self);
            let token = cancel.clone();
            let result = tokio::spawn(async move { pump.run(token).await }).await;

            match result {
                Ok(()) => return,
                Err(e) if self.auto_restart && !cancel.is_cancelled() => {
                    tracing::error!(backoff_ms = backoff.as_millis() as u64, "Ingestion loop crashed, restarting: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    backoff = (backoff * 2).min(MAX_RESTART_BACKOFF);
                }
                Err(e) => {
                    tracing::error!("Ingestion loop crashed: {}", e);
                    return;
                }
            }
        }
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut period_ms = self.sampling_interval_ms();
        let mut ticker = interval(Duration::from_millis(period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            self.tick().await;

            let current = self.sampling_interval_ms();
            if current != period_ms {
                period_ms = current;
                ticker = interval(Duration::from_millis(period_ms));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // the fresh interval fires immediately; consume that tick
                ticker.tick().await;
            }
        }
    }
}

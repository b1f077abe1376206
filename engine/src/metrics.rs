//! Metrics for the telemetry engine
//!
//! Data-quality and detection counters ("telemetry about telemetry"). Plain
//! atomic counters are always kept; with the `metrics` feature the same
//! events are also exported through a Prometheus registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[cfg(feature = "metrics")]
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{EngineError, Result};
use crate::model::AnomalyKind;

/// Snapshot of the engine's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCounters {
    pub samples_accepted: u64,
    pub out_of_order: u64,
    pub out_of_range: u64,
    pub unknown_channel: u64,
    pub evicted: u64,
    pub threshold_breaches: u64,
    pub correlation_deviations: u64,
    pub calibrations_completed: u64,
    pub calibrations_failed: u64,
    pub external_timeouts: u64,
    pub uptime_secs: u64,
}

#[derive(Default)]
struct Counters {
    samples_accepted: AtomicU64,
    out_of_order: AtomicU64,
    out_of_range: AtomicU64,
    unknown_channel: AtomicU64,
    evicted: AtomicU64,
    threshold_breaches: AtomicU64,
    correlation_deviations: AtomicU64,
    calibrations_completed: AtomicU64,
    calibrations_failed: AtomicU64,
    external_timeouts: AtomicU64,
}

#[cfg(feature = "metrics")]
struct PrometheusCounters {
    registry: Registry,
    samples_accepted: IntCounter,
    data_quality: IntCounterVec,
    evicted: IntCounter,
    anomalies: IntCounterVec,
    calibrations: IntCounterVec,
    external_timeouts: IntCounter,
    buffered_samples: IntGauge,
}

#[cfg(feature = "metrics")]
impl PrometheusCounters {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("plantwatch".to_string()), None)?;

        let samples_accepted = IntCounter::new("samples_accepted_total", "Samples stored in ring buffers")?;
        let data_quality = IntCounterVec::new(
            Opts::new("data_quality_events_total", "Rejected or flagged samples by reason"),
            &["reason"],
        )?;
        let evicted = IntCounter::new("samples_evicted_total", "Samples evicted by capacity or retention")?;
        let anomalies = IntCounterVec::new(
            Opts::new("anomalies_total", "Anomaly events emitted by kind"),
            &["kind"],
        )?;
        let calibrations = IntCounterVec::new(
            Opts::new("calibrations_total", "Calibration runs by outcome"),
            &["outcome"],
        )?;
        let external_timeouts = IntCounter::new(
            "external_timeouts_total",
            "External collaborator calls that timed out after retry",
        )?;
        let buffered_samples = IntGauge::new("buffered_samples", "Samples currently held across all buffers")?;

        registry.register(Box::new(samples_accepted.clone()))?;
        registry.register(Box::new(data_quality.clone()))?;
        registry.register(Box::new(evicted.clone()))?;
        registry.register(Box::new(anomalies.clone()))?;
        registry.register(Box::new(calibrations.clone()))?;
        registry.register(Box::new(external_timeouts.clone()))?;
        registry.register(Box::new(buffered_samples.clone()))?;

        Ok(Self {
            registry,
            samples_accepted,
            data_quality,
            evicted,
            anomalies,
            calibrations,
            external_timeouts,
            buffered_samples,
        })
    }
}

/// Metrics collector shared by the pump, detector and calibration tracker
pub struct MetricsCollector {
    counters: Counters,
    start_time: Instant,
    #[cfg(feature = "metrics")]
    prometheus: Option<PrometheusCounters>,
}

impl MetricsCollector {
    /// Create a collector; `export_enabled` controls the Prometheus registry
    pub fn new(export_enabled: bool) -> Self {
        #[cfg(feature = "metrics")]
        let prometheus = if export_enabled {
            match PrometheusCounters::new() {
                Ok(counters) => Some(counters),
                Err(e) => {
                    tracing::error!("Failed to register Prometheus metrics: {}", e);
                    None
                }
            }
        } else {
            None
        };
        #[cfg(not(feature = "metrics"))]
        let _ = export_enabled;

        Self {
            counters: Counters::default(),
            start_time: Instant::now(),
            #[cfg(feature = "metrics")]
            prometheus,
        }
    }

    pub fn record_accepted(&self, evicted: usize) {
        self.counters.samples_accepted.fetch_add(1, Ordering::Relaxed);
        self.counters.evicted.fetch_add(evicted as u64, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        if let Some(prom) = &self.prometheus {
            prom.samples_accepted.inc();
            prom.evicted.inc_by(evicted as u64);
        }
    }

    /// Record a data-quality event by its buffer error label
    pub fn record_quality(&self, reason: &str) {
        let counter = match reason {
            "out_of_order" => &self.counters.out_of_order,
            "out_of_range" => &self.counters.out_of_range,
            "unknown_channel" => &self.counters.unknown_channel,
            other => {
                tracing::warn!("Unknown data quality reason: {}", other);
                return;
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        if let Some(prom) = &self.prometheus {
            prom.data_quality.with_label_values(&[reason]).inc();
        }
    }

    pub fn record_anomaly(&self, kind: AnomalyKind) {
        let counter = match kind {
            AnomalyKind::ThresholdBreach => &self.counters.threshold_breaches,
            AnomalyKind::CorrelationDeviation => &self.counters.correlation_deviations,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        if let Some(prom) = &self.prometheus {
            prom.anomalies.with_label_values(&[kind.as_str()]).inc();
        }
    }

    pub fn record_calibration(&self, succeeded: bool) {
        let (counter, outcome) = if succeeded {
            (&self.counters.calibrations_completed, "completed")
        } else {
            (&self.counters.calibrations_failed, "failed")
        };
        counter.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        if let Some(prom) = &self.prometheus {
            prom.calibrations.with_label_values(&[outcome]).inc();
        }
        #[cfg(not(feature = "metrics"))]
        let _ = outcome;
    }

    pub fn record_external_timeout(&self) {
        self.counters.external_timeouts.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        if let Some(prom) = &self.prometheus {
            prom.external_timeouts.inc();
        }
    }

    pub fn record_buffered(&self, total: usize) {
        #[cfg(feature = "metrics")]
        if let Some(prom) = &self.prometheus {
            prom.buffered_samples.set(total as i64);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = total;
    }

    pub fn snapshot(&self) -> QualityCounters {
        let c = &self.counters;
        QualityCounters {
            samples_accepted: c.samples_accepted.load(Ordering::Relaxed),
            out_of_order: c.out_of_order.load(Ordering::Relaxed),
            out_of_range: c.out_of_range.load(Ordering::Relaxed),
            unknown_channel: c.unknown_channel.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            threshold_breaches: c.threshold_breaches.load(Ordering::Relaxed),
            correlation_deviations: c.correlation_deviations.load(Ordering::Relaxed),
            calibrations_completed: c.calibrations_completed.load(Ordering::Relaxed),
            calibrations_failed: c.calibrations_failed.load(Ordering::Relaxed),
            external_timeouts: c.external_timeouts.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Export metrics in the specified format (`json` or `prometheus`)
    pub fn export_metrics(&self, format: &str) -> Result<String> {
        match format {
            "json" => serde_json::to_string_pretty(&self.snapshot())
                .map_err(|e| EngineError::Generic(format!("metrics export failed: {}", e))),
            #[cfg(feature = "metrics")]
            "prometheus" => {
                let prom = self
                    .prometheus
                    .as_ref()
                    .ok_or_else(|| EngineError::Generic("Prometheus export is disabled".to_string()))?;
                TextEncoder::new()
                    .encode_to_string(&prom.registry.gather())
                    .map_err(|e| EngineError::Generic(format!("metrics export failed: {}", e)))
            }
            other => Err(EngineError::Generic(format!("Unsupported metrics format: {}", other))),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(true)
    }
}

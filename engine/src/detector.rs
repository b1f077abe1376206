//! Anomaly detector
//!
//! Two detection paths run for every accepted sample and their results are
//! unioned:
//!
//! 1. Threshold path: each enabled rule on the sample's channel that matches
//!    produces a `threshold_breach` event with the rule's severity and
//!    confidence 1.0.
//! 2. Correlation path: channels with a declared [`Baseline`] are compared to
//!    the value the baseline predicts from the reference channel's latest
//!    sample. Deviations beyond the tolerance band produce a
//!    `correlation_deviation` event.
//!
//! The detector holds no mutable state of its own; every decision is a
//! function of the buffers, the rule set and the incoming sample.
//!
//! [`Baseline`]: crate::channel::Baseline

use std::sync::Arc;

use uuid::Uuid;

use crate::buffer::BufferStore;
use crate::channel::{Channel, ChannelRegistry};
use crate::model::{deviation_percent, AnomalyEvent, AnomalyKind, Sample, Severity};
use crate::rules::{RuleEngine, ThresholdRule};

/// Confidence of a correlation deviation
///
/// Scales linearly with the deviation and saturates at 1.0 once the deviation
/// reaches twice the tolerance band.
pub fn correlation_confidence(deviation: f64, tolerance: f64) -> f64 {
    if tolerance <= 0.0 {
        return 1.0;
    }
    (deviation / (2.0 * tolerance)).clamp(0.0, 1.0)
}

pub struct AnomalyDetector {
    registry: Arc<ChannelRegistry>,
    buffers: Arc<BufferStore>,
    rules: Arc<RuleEngine>,
    correlation_severity: Severity,
}

impl AnomalyDetector {
    pub fn new(buffers: Arc<BufferStore>, rules: Arc<RuleEngine>) -> Self {
        Self {
            registry: Arc::clone(buffers.registry()),
            buffers,
            rules,
            correlation_severity: Severity::Medium,
        }
    }

    /// Severity assigned to correlation deviations
    pub fn with_correlation_severity(mut self, severity: Severity) -> Self {
        self.correlation_severity = severity;
        self
    }

    /// Evaluate one accepted sample against both detection paths
    pub fn on_sample(&self, sample: &Sample) -> Vec<AnomalyEvent> {
        let Some(channel) = self.registry.get(&sample.channel_id) else {
            tracing::debug!(channel = %sample.channel_id, "Sample for unregistered channel ignored by detector");
            return Vec::new();
        };

        let mut events: Vec<AnomalyEvent> = self
            .rules
            .matching(sample)
            .iter()
            .map(|rule| self.threshold_event(channel, rule, sample))
            .collect();

        if let Some(event) = self.correlation_event(channel, sample) {
            events.push(event);
        }

        for event in &events {
            tracing::info!(
                channel = %event.channel_id,
                kind = event.kind.as_str(),
                severity = %event.severity,
                confidence = event.confidence,
                value = event.observed_value,
                "Anomaly detected"
            );
        }

        events
    }

    fn threshold_event(&self, channel: &Channel, rule: &ThresholdRule, sample: &Sample) -> AnomalyEvent {
        let (low, high) = rule.allowed_range(channel.valid_range.min, channel.valid_range.max);
        let description = if rule.description.is_empty() {
            format!("{} (observed {} {})", rule.summary(), sample.value, channel.display_unit)
        } else {
            format!("{} (observed {} {})", rule.description, sample.value, channel.display_unit)
        };

        AnomalyEvent {
            id: Uuid::new_v4().to_string(),
            channel_id: sample.channel_id.clone(),
            rule_id: Some(rule.id.to_string()),
            kind: AnomalyKind::ThresholdBreach,
            severity: rule.severity,
            confidence: 1.0,
            timestamp_ms: sample.timestamp_ms,
            description,
            observed_value: sample.value,
            expected_range: (low, high),
            deviation_percent: deviation_percent(sample.value, low, high),
        }
    }

    fn correlation_event(&self, channel: &Channel, sample: &Sample) -> Option<AnomalyEvent> {
        let baseline = channel.baseline.as_ref()?;

        let reference = match self.buffers.latest(&baseline.reference_channel) {
            Ok(Some(reference)) => reference,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(channel = %channel.id, error = %e, "Baseline reference unavailable");
                return None;
            }
        };

        let expected = baseline.expected(reference.value);
        let deviation = (sample.value - expected).abs();
        if deviation <= baseline.tolerance {
            return None;
        }

        let low = expected - baseline.tolerance;
        let high = expected + baseline.tolerance;

        Some(AnomalyEvent {
            id: Uuid::new_v4().to_string(),
            channel_id: sample.channel_id.clone(),
            rule_id: None,
            kind: AnomalyKind::CorrelationDeviation,
            severity: self.correlation_severity,
            confidence: correlation_confidence(deviation, baseline.tolerance),
            timestamp_ms: sample.timestamp_ms,
            description: format!(
                "{} = {:.3} {} deviates from {:.3} expected for {} = {:.1}",
                channel.id, sample.value, channel.display_unit, expected, reference.channel_id, reference.value
            ),
            observed_value: sample.value,
            expected_range: (low, high),
            deviation_percent: deviation_percent(sample.value, low, high),
        })
    }
}

//! Shared data model for samples, severities and anomaly events

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Channel identifier (e.g. `kiln_temperature`)
pub type ChannelId = String;

/// One timestamped reading for a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub channel_id: ChannelId,
    pub timestamp_ms: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(channel_id: impl Into<ChannelId>, timestamp_ms: i64, value: f64) -> Self {
        Self {
            channel_id: channel_id.into(),
            timestamp_ms,
            value,
        }
    }

    /// Sample timestamp as UTC wall-clock time
    pub fn timestamp(&self) -> DateTime<Utc> {
        millis_to_datetime(self.timestamp_ms)
    }
}

/// A sample as held by a ring buffer slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSample {
    pub sample: Sample,

    /// Set when the value fell outside the channel's valid range
    pub out_of_range: bool,
}

/// Severity shared by threshold rules, anomaly events and calibration status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Severity::Low, Severity::Medium, Severity::High, Severity::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    /// Accepts the canonical names plus the status words operators still type
    /// (`ok`, `good`, `warn`, `warning`, `error`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" | "ok" | "good" => Ok(Severity::Low),
            "medium" | "warn" | "warning" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" | "error" => Ok(Severity::Critical),
            other => Err(format!("Unknown severity: {}", other)),
        }
    }
}

/// How an anomaly was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    ThresholdBreach,
    CorrelationDeviation,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::ThresholdBreach => "threshold_breach",
            AnomalyKind::CorrelationDeviation => "correlation_deviation",
        }
    }
}

/// Immutable record of one detected anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: String,
    pub channel_id: ChannelId,
    pub rule_id: Option<String>,
    pub kind: AnomalyKind,
    pub severity: Severity,

    /// Detection confidence in `[0, 1]`
    pub confidence: f64,
    pub timestamp_ms: i64,
    pub description: String,

    /// Value of the triggering sample
    pub observed_value: f64,

    /// Range the value was expected to stay within
    pub expected_range: (f64, f64),

    /// Distance outside `expected_range`, as a percentage of its nearest bound
    pub deviation_percent: f64,
}

impl AnomalyEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        millis_to_datetime(self.timestamp_ms)
    }
}

/// Operator-facing lifecycle of a logged alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Investigating,
    Resolved,
}

impl AlertStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

/// Percentage by which `value` sits outside `[low, high]` (0 when inside)
pub fn deviation_percent(value: f64, low: f64, high: f64) -> f64 {
    let (excess, bound) = if value > high {
        (value - high, high)
    } else if value < low {
        (low - value, low)
    } else {
        return 0.0;
    };

    if bound == 0.0 {
        excess * 100.0
    } else {
        excess / bound.abs() * 100.0
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_parsing_accepts_legacy_words() {
        assert_eq!("warn".parse::<Severity>().unwrap(), Severity::Medium);
        assert_eq!("good".parse::<Severity>().unwrap(), Severity::Low);
        assert_eq!("Critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low < Severity::Medium);
    }

    #[test]
    fn test_deviation_percent() {
        assert_eq!(deviation_percent(50.0, 20.0, 80.0), 0.0);
        assert!((deviation_percent(1520.0, 0.0, 1500.0) - 1.3333).abs() < 1e-3);
        assert!((deviation_percent(1.8, 2.5, f64::INFINITY) - 28.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_timestamp_conversion() {
        let sample = Sample::new("system_pressure", 1_700_000_000_000, 3.0);
        assert_eq!(sample.timestamp().timestamp_millis(), 1_700_000_000_000);
    }
}

//! Channel registry
//!
//! Declares the fixed set of monitored metrics. Channels are created once at
//! startup from configuration and never mutated while the process runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::model::ChannelId;

/// Inclusive physical range a channel can legitimately report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Expected value of a channel as a function of another channel's latest value
///
/// `expected = intercept + slope * (reference_value - pivot)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Channel whose latest value drives the expectation
    pub reference_channel: ChannelId,
    pub intercept: f64,
    pub slope: f64,
    #[serde(default)]
    pub pivot: f64,

    /// Allowed absolute deviation before a correlation anomaly is raised
    pub tolerance: f64,
}

impl Baseline {
    pub fn expected(&self, reference_value: f64) -> f64 {
        self.intercept + self.slope * (reference_value - self.pivot)
    }
}

/// Immutable channel descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub display_unit: String,

    /// Nominal operating point, used to seed simulated sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nominal: Option<f64>,
    pub valid_range: ValueRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Baseline>,
}

impl Channel {
    pub fn new(id: impl Into<ChannelId>, display_unit: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            id: id.into(),
            display_unit: display_unit.into(),
            valid_range: ValueRange::new(min, max),
            baseline: None,
            nominal: None,
        }
    }

    pub fn with_baseline(mut self, baseline: Baseline) -> Self {
        self.baseline = Some(baseline);
        self
    }

    pub fn with_nominal(mut self, nominal: f64) -> Self {
        self.nominal = Some(nominal);
        self
    }

    /// Nominal value, falling back to the middle of the valid range
    pub fn nominal_value(&self) -> f64 {
        self.nominal
            .unwrap_or((self.valid_range.min + self.valid_range.max) / 2.0)
    }
}

/// The set of channels monitored by one plant
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<ChannelId, Channel>,
}

impl ChannelRegistry {
    /// Build a registry, validating ids, ranges and baseline references
    pub fn new(channels: Vec<Channel>) -> ConfigResult<Self> {
        let mut map = BTreeMap::new();

        for channel in channels {
            if channel.id.trim().is_empty() {
                return Err(ConfigError::ValidationFailed {
                    reason: "channel id must not be empty".to_string(),
                });
            }

            let range = channel.valid_range;
            if !range.min.is_finite() || !range.max.is_finite() || range.min >= range.max {
                return Err(ConfigError::InvalidValue {
                    field: format!("channels.{}.valid_range", channel.id),
                    value: format!("[{}, {}]", range.min, range.max),
                });
            }

            if let Some(baseline) = &channel.baseline {
                if !(baseline.tolerance > 0.0) {
                    return Err(ConfigError::InvalidValue {
                        field: format!("channels.{}.baseline.tolerance", channel.id),
                        value: baseline.tolerance.to_string(),
                    });
                }
            }

            let id = channel.id.clone();
            if map.insert(id.clone(), channel).is_some() {
                return Err(ConfigError::ValidationFailed {
                    reason: format!("duplicate channel id: {}", id),
                });
            }
        }

        for channel in map.values() {
            if let Some(baseline) = &channel.baseline {
                if baseline.reference_channel == channel.id
                    || !map.contains_key(&baseline.reference_channel)
                {
                    return Err(ConfigError::ValidationFailed {
                        reason: format!(
                            "channel {} baseline references invalid channel {}",
                            channel.id, baseline.reference_channel
                        ),
                    });
                }
            }
        }

        Ok(Self { channels: map })
    }

    /// The kiln plant channel set used when no configuration is supplied
    pub fn kiln_plant() -> Self {
        let channels = default_kiln_channels()
            .into_iter()
            .map(|channel| (channel.id.clone(), channel))
            .collect();
        Self { channels }
    }

    pub fn get(&self, id: &str) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    /// Channels in id order
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn ids(&self) -> Vec<ChannelId> {
        self.channels.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Kiln plant channel declarations
pub fn default_kiln_channels() -> Vec<Channel> {
    vec![
        Channel::new("kiln_temperature", "°C", 0.0, 2000.0).with_nominal(1450.0),
        Channel::new("system_pressure", "bar", 0.0, 10.0)
            .with_nominal(2.6)
            .with_baseline(Baseline {
                reference_channel: "kiln_temperature".to_string(),
                intercept: 2.5,
                slope: 0.002,
                pivot: 1400.0,
                tolerance: 0.4,
            }),
        Channel::new("material_flow_rate", "t/h", 0.0, 500.0).with_nominal(240.0),
        Channel::new("oxygen_level", "%", 0.0, 25.0).with_nominal(3.5),
        Channel::new("energy_consumption", "kWh", 0.0, 5000.0).with_nominal(3200.0),
    ]
}

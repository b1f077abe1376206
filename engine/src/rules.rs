//! Threshold rule engine
//!
//! CRUD store of operator-defined alert rules and the pure predicate used to
//! evaluate a sample against them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelRegistry;
use crate::error::{RuleError, RuleResult};
use crate::locks;
use crate::model::{ChannelId, Sample, Severity};

/// Stable rule identifier, rendered as `rule-<n>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule-{}", self.0)
    }
}

impl std::str::FromStr for RuleId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("rule-").unwrap_or(s);
        digits
            .parse::<u64>()
            .map(RuleId)
            .map_err(|_| format!("Invalid rule id: {}", s))
    }
}

/// Rule predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Above,
    Below,
    OutsideRange,
}

impl std::str::FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "above" => Ok(Condition::Above),
            "below" => Ok(Condition::Below),
            "outside_range" | "outsiderange" => Ok(Condition::OutsideRange),
            other => Err(format!("Unknown condition: {}", other)),
        }
    }
}

/// Rule fields supplied by the operator when creating or editing a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub channel_id: ChannelId,
    pub condition: Condition,
    pub value: f64,
    #[serde(default)]
    pub max_value: Option<f64>,
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

fn default_enabled() -> bool {
    true
}

impl RuleDraft {
    pub fn new(channel_id: impl Into<ChannelId>, condition: Condition, value: f64, severity: Severity) -> Self {
        Self {
            channel_id: channel_id.into(),
            condition,
            value,
            max_value: None,
            severity,
            enabled: true,
            description: String::new(),
        }
    }

    pub fn with_max(mut self, max_value: f64) -> Self {
        self.max_value = Some(max_value);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check the rule invariants
    pub fn validate(&self) -> RuleResult<()> {
        if !self.value.is_finite() {
            return Err(RuleError::InvalidRule {
                reason: format!("threshold value must be finite, got {}", self.value),
            });
        }

        match (self.condition, self.max_value) {
            (Condition::OutsideRange, None) => Err(RuleError::InvalidRule {
                reason: "outside_range requires max_value".to_string(),
            }),
            (Condition::OutsideRange, Some(max)) if !max.is_finite() || max <= self.value => {
                Err(RuleError::InvalidRule {
                    reason: format!("outside_range requires max_value > value ({} <= {})", max, self.value),
                })
            }
            _ => Ok(()),
        }
    }
}

/// A persisted threshold rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub id: RuleId,
    pub channel_id: ChannelId,
    pub condition: Condition,
    pub value: f64,
    #[serde(default)]
    pub max_value: Option<f64>,
    pub severity: Severity,
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

impl ThresholdRule {
    fn from_draft(id: RuleId, draft: RuleDraft) -> Self {
        Self {
            id,
            channel_id: draft.channel_id,
            condition: draft.condition,
            value: draft.value,
            max_value: draft.max_value,
            severity: draft.severity,
            enabled: draft.enabled,
            description: draft.description,
        }
    }

    /// Pure predicate: does `value` trip this rule?
    pub fn matches(&self, value: f64) -> bool {
        match self.condition {
            Condition::Above => value > self.value,
            Condition::Below => value < self.value,
            Condition::OutsideRange => {
                let max = self.max_value.unwrap_or(f64::INFINITY);
                value < self.value || value > max
            }
        }
    }

    /// Range of values that do not trip the rule, clipped to `[floor, ceiling]`
    pub fn allowed_range(&self, floor: f64, ceiling: f64) -> (f64, f64) {
        match self.condition {
            Condition::Above => (floor, self.value),
            Condition::Below => (self.value, ceiling),
            Condition::OutsideRange => (self.value, self.max_value.unwrap_or(ceiling)),
        }
    }

    pub fn summary(&self) -> String {
        match (self.condition, self.max_value) {
            (Condition::OutsideRange, Some(max)) => {
                format!("{} outside [{}, {}]", self.channel_id, self.value, max)
            }
            (Condition::Above, _) => format!("{} above {}", self.channel_id, self.value),
            (Condition::Below, _) => format!("{} below {}", self.channel_id, self.value),
            (Condition::OutsideRange, None) => format!("{} outside range", self.channel_id),
        }
    }
}

/// Result of evaluating one enabled rule against a sample
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule_id: RuleId,
    pub matched: bool,
}

/// Thread-safe rule store
pub struct RuleEngine {
    registry: Arc<ChannelRegistry>,
    rules: RwLock<BTreeMap<RuleId, ThresholdRule>>,
    next_id: AtomicU64,
}

impl RuleEngine {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            rules: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Rebuild an engine from persisted rules
    ///
    /// Rules that no longer validate, or whose channel was removed from the
    /// registry, are skipped with a warning rather than failing startup.
    pub fn with_rules(registry: Arc<ChannelRegistry>, rules: Vec<ThresholdRule>) -> Self {
        let engine = Self::new(registry);
        let mut max_id = 0;
        {
            let mut map = locks::write(&engine.rules);
            for rule in rules {
                let draft = RuleDraft {
                    channel_id: rule.channel_id.clone(),
                    condition: rule.condition,
                    value: rule.value,
                    max_value: rule.max_value,
                    severity: rule.severity,
                    enabled: rule.enabled,
                    description: rule.description.clone(),
                };
                if let Err(e) = engine.check(&draft) {
                    tracing::warn!(rule = %rule.id, error = %e, "Skipping persisted rule");
                    continue;
                }
                max_id = max_id.max(rule.id.0);
                map.insert(rule.id, rule);
            }
        }
        engine.next_id.store(max_id + 1, Ordering::SeqCst);
        engine
    }

    fn check(&self, draft: &RuleDraft) -> RuleResult<()> {
        if !self.registry.contains(&draft.channel_id) {
            return Err(RuleError::UnknownChannel {
                channel: draft.channel_id.clone(),
            });
        }
        draft.validate()
    }

    /// Validate and store a new rule
    pub fn add_rule(&self, draft: RuleDraft) -> RuleResult<RuleId> {
        self.check(&draft)?;

        let id = RuleId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let rule = ThresholdRule::from_draft(id, draft);
        tracing::info!(rule = %id, summary = %rule.summary(), severity = %rule.severity, "Rule added");
        locks::write(&self.rules).insert(id, rule);
        Ok(id)
    }

    /// Replace every field of an existing rule except its id
    pub fn update_rule(&self, id: RuleId, draft: RuleDraft) -> RuleResult<ThresholdRule> {
        self.check(&draft)?;

        let mut rules = locks::write(&self.rules);
        let slot = rules.get_mut(&id).ok_or_else(|| RuleError::NotFound { id: id.to_string() })?;
        *slot = ThresholdRule::from_draft(id, draft);
        tracing::info!(rule = %id, summary = %slot.summary(), "Rule updated");
        Ok(slot.clone())
    }

    pub fn remove_rule(&self, id: RuleId) -> RuleResult<ThresholdRule> {
        let removed = locks::write(&self.rules)
            .remove(&id)
            .ok_or_else(|| RuleError::NotFound { id: id.to_string() })?;
        tracing::info!(rule = %id, "Rule removed");
        Ok(removed)
    }

    pub fn set_enabled(&self, id: RuleId, enabled: bool) -> RuleResult<()> {
        let mut rules = locks::write(&self.rules);
        let rule = rules.get_mut(&id).ok_or_else(|| RuleError::NotFound { id: id.to_string() })?;
        rule.enabled = enabled;
        tracing::info!(rule = %id, enabled, "Rule toggled");
        Ok(())
    }

    /// Put a previously held rule back under its own id
    pub(crate) fn restore(&self, rule: ThresholdRule) {
        tracing::debug!(rule = %rule.id, "Rule restored");
        locks::write(&self.rules).insert(rule.id, rule);
    }

    /// Drop a rule without logging a removal
    pub(crate) fn discard(&self, id: RuleId) {
        locks::write(&self.rules).remove(&id);
    }

    pub fn get(&self, id: RuleId) -> Option<ThresholdRule> {
        locks::read(&self.rules).get(&id).cloned()
    }

    /// All rules in id order
    pub fn list(&self) -> Vec<ThresholdRule> {
        locks::read(&self.rules).values().cloned().collect()
    }

    pub fn rules_for(&self, channel: &str) -> Vec<ThresholdRule> {
        locks::read(&self.rules)
            .values()
            .filter(|rule| rule.channel_id == channel)
            .cloned()
            .collect()
    }

    /// Evaluate every enabled rule on the sample's channel
    ///
    /// Disabled rules are skipped entirely and do not appear in the result.
    pub fn evaluate(&self, sample: &Sample) -> Vec<RuleMatch> {
        locks::read(&self.rules)
            .values()
            .filter(|rule| rule.enabled && rule.channel_id == sample.channel_id)
            .map(|rule| RuleMatch {
                rule_id: rule.id,
                matched: rule.matches(sample.value),
            })
            .collect()
    }

    /// Enabled rules on the sample's channel that the sample trips
    pub fn matching(&self, sample: &Sample) -> Vec<ThresholdRule> {
        locks::read(&self.rules)
            .values()
            .filter(|rule| rule.enabled && rule.channel_id == sample.channel_id && rule.matches(sample.value))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        locks::read(&self.rules).len()
    }

    pub fn is_empty(&self) -> bool {
        locks::read(&self.rules).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RuleEngine {
        RuleEngine::new(Arc::new(ChannelRegistry::kiln_plant()))
    }

    #[test]
    fn test_above_rule_on_kiln_temperature() {
        let engine = engine();
        let id = engine
            .add_rule(RuleDraft::new("kiln_temperature", Condition::Above, 1500.0, Severity::High))
            .unwrap();

        let hot = engine.evaluate(&Sample::new("kiln_temperature", 1, 1520.0));
        assert_eq!(hot, vec![RuleMatch { rule_id: id, matched: true }]);

        let nominal = engine.evaluate(&Sample::new("kiln_temperature", 2, 1499.0));
        assert_eq!(nominal, vec![RuleMatch { rule_id: id, matched: false }]);
    }

    #[test]
    fn test_outside_range_rule() {
        let engine = engine();
        engine
            .add_rule(
                RuleDraft::new("oxygen_level", Condition::OutsideRange, 20.0, Severity::Low).with_max(80.0),
            )
            .unwrap();

        for (value, expected) in [(10.0, true), (90.0, true), (50.0, false)] {
            let matches = engine.evaluate(&Sample::new("oxygen_level", 1, value));
            assert_eq!(matches[0].matched, expected, "value {}", value);
        }
    }

    #[test]
    fn test_outside_range_requires_ordered_bounds() {
        let engine = engine();
        let inverted = RuleDraft::new("oxygen_level", Condition::OutsideRange, 20.0, Severity::Low).with_max(20.0);
        assert!(matches!(engine.add_rule(inverted), Err(RuleError::InvalidRule { .. })));

        let missing = RuleDraft::new("oxygen_level", Condition::OutsideRange, 20.0, Severity::Low);
        assert!(engine.add_rule(missing).is_err());
        assert!(engine.is_empty());
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let engine = engine();
        let result = engine.add_rule(RuleDraft::new("humidity", Condition::Above, 1.0, Severity::Low));
        assert!(matches!(result, Err(RuleError::UnknownChannel { .. })));
    }

    #[test]
    fn test_disabled_rules_are_not_evaluated() {
        let engine = engine();
        let id = engine
            .add_rule(RuleDraft::new("system_pressure", Condition::Below, 2.5, Severity::Medium))
            .unwrap();
        let sample = Sample::new("system_pressure", 1, 2.0);
        assert_eq!(engine.matching(&sample).len(), 1);

        engine.set_enabled(id, false).unwrap();
        assert!(engine.evaluate(&sample).is_empty());
        assert!(engine.matching(&sample).is_empty());
    }

    #[test]
    fn test_stacked_rules_match_independently() {
        let engine = engine();
        engine
            .add_rule(RuleDraft::new("kiln_temperature", Condition::Above, 1500.0, Severity::Medium))
            .unwrap();
        engine
            .add_rule(RuleDraft::new("kiln_temperature", Condition::Above, 1550.0, Severity::Critical))
            .unwrap();

        let matched = engine.matching(&Sample::new("kiln_temperature", 1, 1600.0));
        let severities: Vec<Severity> = matched.iter().map(|r| r.severity).collect();
        assert_eq!(severities, vec![Severity::Medium, Severity::Critical]);
    }

    #[test]
    fn test_update_preserves_id_and_revalidates() {
        let engine = engine();
        let id = engine
            .add_rule(RuleDraft::new("kiln_temperature", Condition::Above, 1500.0, Severity::High))
            .unwrap();

        let updated = engine
            .update_rule(id, RuleDraft::new("kiln_temperature", Condition::Above, 1480.0, Severity::Critical))
            .unwrap();
        assert_eq!(updated.id, id);
        assert_eq!(updated.value, 1480.0);

        let bad = RuleDraft::new("kiln_temperature", Condition::OutsideRange, 10.0, Severity::Low).with_max(5.0);
        assert!(engine.update_rule(id, bad).is_err());
        assert_eq!(engine.get(id).unwrap().value, 1480.0);
    }

    #[test]
    fn test_with_rules_continues_id_sequence() {
        let registry = Arc::new(ChannelRegistry::kiln_plant());
        let persisted = vec![ThresholdRule {
            id: RuleId(7),
            channel_id: "kiln_temperature".to_string(),
            condition: Condition::Above,
            value: 1500.0,
            max_value: None,
            severity: Severity::High,
            enabled: true,
            description: String::new(),
        }];
        let engine = RuleEngine::with_rules(registry, persisted);
        let id = engine
            .add_rule(RuleDraft::new("oxygen_level", Condition::Below, 1.0, Severity::Low))
            .unwrap();
        assert_eq!(id, RuleId(8));
    }

    #[test]
    fn test_evaluate_is_pure() {
        let engine = engine();
        engine
            .add_rule(RuleDraft::new("kiln_temperature", Condition::Above, 1500.0, Severity::High))
            .unwrap();
        let sample = Sample::new("kiln_temperature", 1, 1520.0);
        assert_eq!(engine.evaluate(&sample), engine.evaluate(&sample));
    }

    #[test]
    fn test_rule_id_parsing() {
        assert_eq!("rule-12".parse::<RuleId>().unwrap(), RuleId(12));
        assert_eq!("3".parse::<RuleId>().unwrap(), RuleId(3));
        assert!("rule-x".parse::<RuleId>().is_err());
    }
}

//! Append-only anomaly event log
//!
//! Events are immutable; only the operator-facing [`AlertStatus`] attached to
//! each entry changes. The log is bounded like the ring buffers: once full the
//! oldest entry is dropped, and entries older than the retention window
//! (relative to the newest logged event) are pruned.

use std::collections::VecDeque;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::locks;
use crate::model::{AlertStatus, AnomalyEvent, AnomalyKind, ChannelId, Severity};

/// One logged anomaly and its handling status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub event: AnomalyEvent,
    pub status: AlertStatus,
}

/// Filter for [`AlertLog::query`]; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub channel_id: Option<ChannelId>,
    pub min_severity: Option<Severity>,
    pub status: Option<AlertStatus>,
    pub kind: Option<AnomalyKind>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
    pub limit: Option<usize>,
}

impl AlertFilter {
    fn accepts(&self, record: &AlertRecord) -> bool {
        let event = &record.event;
        self.channel_id.as_ref().map_or(true, |c| *c == event.channel_id)
            && self.min_severity.map_or(true, |s| event.severity >= s)
            && self.status.map_or(true, |s| record.status == s)
            && self.kind.map_or(true, |k| event.kind == k)
            && self.from_ms.map_or(true, |from| event.timestamp_ms >= from)
            && self.to_ms.map_or(true, |to| event.timestamp_ms <= to)
    }
}

pub struct AlertLog {
    entries: RwLock<VecDeque<AlertRecord>>,
    capacity: usize,
    retention_ms: Option<i64>,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            retention_ms: None,
        }
    }

    /// Apply the ring buffers' time-based retention to the log
    pub fn with_retention(mut self, retention_ms: Option<i64>) -> Self {
        self.retention_ms = retention_ms;
        self
    }

    /// Append events in order, dropping the oldest once at capacity
    pub fn extend(&self, events: impl IntoIterator<Item = AnomalyEvent>) {
        let mut entries = locks::write(&self.entries);
        for event in events {
            entries.push_back(AlertRecord {
                event,
                status: AlertStatus::New,
            });
            if entries.len() > self.capacity {
                entries.pop_front();
            }
        }

        let Some(retention) = self.retention_ms else {
            return;
        };
        let Some(newest_ms) = entries.iter().map(|record| record.event.timestamp_ms).max() else {
            return;
        };
        let horizon = newest_ms.saturating_sub(retention);
        let before = entries.len();
        entries.retain(|record| record.event.timestamp_ms >= horizon);
        if entries.len() < before {
            tracing::debug!(pruned = before - entries.len(), horizon, "Pruned alerts past retention");
        }
    }

    /// Unresolved events, oldest first
    pub fn active(&self) -> Vec<AnomalyEvent> {
        locks::read(&self.entries)
            .iter()
            .filter(|record| record.status.is_active())
            .map(|record| record.event.clone())
            .collect()
    }

    /// Matching records, newest first
    pub fn query(&self, filter: &AlertFilter) -> Vec<AlertRecord> {
        let entries = locks::read(&self.entries);
        let matching = entries.iter().rev().filter(|record| filter.accepts(record)).cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub fn get(&self, event_id: &str) -> Option<AlertRecord> {
        locks::read(&self.entries)
            .iter()
            .find(|record| record.event.id == event_id)
            .cloned()
    }

    /// Move an alert to a new status; returns false if the id is not logged
    pub fn set_status(&self, event_id: &str, status: AlertStatus) -> bool {
        let mut entries = locks::write(&self.entries);
        match entries.iter_mut().find(|record| record.event.id == event_id) {
            Some(record) => {
                tracing::info!(alert = event_id, from = ?record.status, to = ?status, "Alert status changed");
                record.status = status;
                true
            }
            None => false,
        }
    }

    pub fn acknowledge(&self, event_id: &str) -> bool {
        self.set_status(event_id, AlertStatus::Acknowledged)
    }

    pub fn investigate(&self, event_id: &str) -> bool {
        self.set_status(event_id, AlertStatus::Investigating)
    }

    pub fn resolve(&self, event_id: &str) -> bool {
        self.set_status(event_id, AlertStatus::Resolved)
    }

    pub fn len(&self) -> usize {
        locks::read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        locks::read(&self.entries).is_empty()
    }

    pub fn clear(&self) {
        locks::write(&self.entries).clear();
    }
}

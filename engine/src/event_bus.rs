// Push-based event bus: the presentation layer drains this instead of polling
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::calibration::CalibrationRecord;
use crate::model::{AnomalyEvent, ChannelId, Sample};
use crate::replay::{Frame, Position};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Sample(Sample),
    Anomaly(AnomalyEvent),
    DataQuality {
        channel_id: ChannelId,
        timestamp_ms: i64,
        issue: String,
    },
    CalibrationProgress {
        sensor_id: String,
        percent: u8,
    },
    CalibrationFinished(CalibrationRecord),
    CalibrationFailed {
        sensor_id: String,
        reason: String,
    },
    ReplayFrame(Frame),
    ReplayPosition(Position),
}

impl TelemetryEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            TelemetryEvent::Sample(_) => "sample",
            TelemetryEvent::Anomaly(_) => "anomaly",
            TelemetryEvent::DataQuality { .. } => "data_quality",
            TelemetryEvent::CalibrationProgress { .. } => "calibration_progress",
            TelemetryEvent::CalibrationFinished(_) => "calibration_finished",
            TelemetryEvent::CalibrationFailed { .. } => "calibration_failed",
            TelemetryEvent::ReplayFrame(_) => "replay_frame",
            TelemetryEvent::ReplayPosition(_) => "replay_position",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    broadcast_tx: broadcast::Sender<TelemetryEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self { broadcast_tx }
    }

    /// Subscribers that fall behind lose the oldest events, never block publishers
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.broadcast_tx.subscribe()
    }

    pub fn publish(&self, event: TelemetryEvent) {
        // No subscribers is the normal headless case
        if self.broadcast_tx.send(event).is_err() {
            tracing::trace!("Event dropped: no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(TelemetryEvent::Sample(Sample::new("oxygen_level", 1, 3.4)));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "sample");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(TelemetryEvent::CalibrationProgress {
            sensor_id: "kiln_temperature".to_string(),
            percent: 10,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_newest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for ts in 0..5 {
            bus.publish(TelemetryEvent::Sample(Sample::new("oxygen_level", ts, 3.0)));
        }

        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(3))));
        match rx.recv().await.unwrap() {
            TelemetryEvent::Sample(sample) => assert_eq!(sample.timestamp_ms, 3),
            other => panic!("unexpected event {:?}", other),
        }
    }
}

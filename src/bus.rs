// src/bus.rs
//
// Typed in-process publish/subscribe over tagged variant messages, rather
// than the reference engine's looser `Dispatcher` sink-list pattern.
// Backed by `tokio::sync::broadcast` so every subscriber (SSE stream,
// notifier channel) sees every event independently.

use tokio::sync::broadcast;

use crate::events::{Metric, PersistedAlert};

#[derive(Debug, Clone)]
pub enum BusEvent {
    MetricAggregated(Metric),
    AlertTriggered(PersistedAlert),
}

pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Publish is best-effort: with no subscribers the send fails and is
    /// dropped silently — alert delivery over the bus never blocks or
    /// errors the caller.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AlertType, CandidateAlert, Severity, StatsSnapshot};
    use chrono::Utc;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let alert = PersistedAlert {
            id: uuid::Uuid::new_v4(),
            candidate: CandidateAlert {
                service: "api".into(),
                alert_type: AlertType::ErrorSpike,
                severity: Severity::High,
                message: "m".into(),
                bucket_window_start: Utc::now(),
                stats: StatsSnapshot { mean: 0.0, std_dev: 0.0, value: 0.0, count: 0 },
            },
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
        };
        bus.publish(BusEvent::AlertTriggered(alert));
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, BusEvent::AlertTriggered(_)));
    }
}

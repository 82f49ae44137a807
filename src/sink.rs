// src/sink.rs
//
// Alert Sink Adapter — a pure fan-out adapter with no policy of its own:
// hands a candidate to the Deduplicator, retrying a transient repository
// failure with backoff, and on admission publishes the persisted alert to
// the event bus. Grounded in the reference engine's `engine/dispatcher.rs`
// (a thin sink that forwards to whatever outbound channels are configured
// and does not itself decide anything).

use std::sync::Arc;

use tracing::error;

use crate::bus::{BusEvent, EventBus};
use crate::dedup::Deduplicator;
use crate::error::retry_with_backoff;
use crate::events::{CandidateAlert, PersistedAlert};

pub struct AlertSink {
    dedup: Arc<Deduplicator>,
    bus: Arc<EventBus>,
    alert_retry_attempts: u32,
}

impl AlertSink {
    pub fn new(dedup: Arc<Deduplicator>, bus: Arc<EventBus>, alert_retry_attempts: u32) -> Self {
        Self { dedup, bus, alert_retry_attempts }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Submit a candidate alert, retrying a transient repository failure
    /// with backoff up to `alertRetryAttempts`. Returns the persisted
    /// alert if admitted, or `None` if the Deduplicator rejected it as a
    /// repeat, or if every retry was exhausted — missing an alert is
    /// preferred to propagating a failure up into the detector's hot path.
    pub async fn submit(&self, candidate: CandidateAlert) -> Option<PersistedAlert> {
        let dedup = self.dedup.clone();
        let result = retry_with_backoff(self.alert_retry_attempts, move || {
            let dedup = dedup.clone();
            let candidate = candidate.clone();
            async move { dedup.try_admit(candidate).await }
        })
        .await;

        match result {
            Ok(Some(persisted)) => {
                self.bus.publish(BusEvent::AlertTriggered(persisted.clone()));
                Some(persisted)
            }
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "alert admission failed after retries exhausted");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::{AlertType, Severity, StatsSnapshot};
    use crate::repository::InMemoryRepository;
    use chrono::Utc;

    fn candidate(service: &str) -> CandidateAlert {
        CandidateAlert {
            service: service.to_string(),
            alert_type: AlertType::ErrorSpike,
            severity: Severity::High,
            message: "spike".into(),
            bucket_window_start: Utc::now(),
            stats: StatsSnapshot { mean: 1.0, std_dev: 1.0, value: 10.0, count: 30 },
        }
    }

    #[tokio::test]
    async fn admitted_alert_is_published_on_bus() {
        let repo = Arc::new(InMemoryRepository::new());
        let dedup = Arc::new(Deduplicator::new(repo, EngineConfig::default()));
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let sink = AlertSink::new(dedup, bus, 3);

        let persisted = sink.submit(candidate("api")).await;
        assert!(persisted.is_some());
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, BusEvent::AlertTriggered(_)));
    }

    #[tokio::test]
    async fn duplicate_submission_returns_none() {
        let repo = Arc::new(InMemoryRepository::new());
        let dedup = Arc::new(Deduplicator::new(repo, EngineConfig::default()));
        let bus = Arc::new(EventBus::new(16));
        let sink = AlertSink::new(dedup, bus, 3);

        assert!(sink.submit(candidate("api")).await.is_some());
        assert!(sink.submit(candidate("api")).await.is_none());
    }
}

// src/repository.rs
//
// Repository collaborator trait plus an in-memory implementation used by
// tests and by single-process deployments with no `--database-url`
// configured. Grounded in the reference engine's `redis_state.rs` shape:
// an async trait over a pluggable backing store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::events::{CandidateAlert, Metric, PersistedAlert};

#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_metrics_batch(&self, metrics: &[Metric]) -> Result<()>;

    async fn try_acquire_advisory_lock(&self, key: i64) -> Result<bool>;
    async fn release_advisory_lock(&self, key: i64) -> Result<()>;

    /// Count unresolved alerts for (service, alertType) created within the
    /// last `db_interval_seconds`, measured by the repository's own clock.
    async fn count_unresolved_alerts_since(
        &self,
        service: &str,
        alert_type: &str,
        db_interval_seconds: i64,
    ) -> Result<i64>;

    async fn insert_alert(&self, candidate: CandidateAlert) -> Result<PersistedAlert>;

    async fn mark_service_activity(&self, service: &str, timestamp: DateTime<Utc>) -> Result<()>;
    async fn list_stale_services(&self, threshold: DateTime<Utc>) -> Result<Vec<String>>;

    /// The repository's notion of "now" — for the in-memory implementation
    /// this is `Utc::now()`; for the Postgres implementation it is the
    /// database server clock, used by the windowed duplicate check so
    /// replicas with skewed clocks still agree on recency.
    async fn server_now(&self) -> Result<DateTime<Utc>>;
}

#[derive(Default)]
struct InMemoryState {
    alerts: Vec<PersistedAlert>,
    locks: std::collections::HashSet<i64>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

/// In-memory `Repository` backing the default (no `--database-url`)
/// deployment mode and the end-to-end scenario tests.
pub struct InMemoryRepository {
    state: Mutex<InMemoryState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self { state: Mutex::new(InMemoryState::default()) }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn insert_metrics_batch(&self, _metrics: &[Metric]) -> Result<()> {
        // Idempotent on (service, metricType, windowStart); the in-memory
        // mode has no separate metrics table to enforce this against, so
        // insertion is a no-op success.
        Ok(())
    }

    async fn try_acquire_advisory_lock(&self, key: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.locks.insert(key))
    }

    async fn release_advisory_lock(&self, key: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.locks.remove(&key);
        Ok(())
    }

    async fn count_unresolved_alerts_since(
        &self,
        service: &str,
        alert_type: &str,
        db_interval_seconds: i64,
    ) -> Result<i64> {
        let state = self.state.lock().await;
        let now = Utc::now();
        let cutoff = now - ChronoDuration::seconds(db_interval_seconds);
        let count = state
            .alerts
            .iter()
            .filter(|a| {
                !a.resolved
                    && a.candidate.service == service
                    && a.candidate.alert_type.to_string() == alert_type
                    && a.created_at > cutoff
            })
            .count();
        Ok(count as i64)
    }

    async fn insert_alert(&self, candidate: CandidateAlert) -> Result<PersistedAlert> {
        let mut state = self.state.lock().await;
        let persisted = PersistedAlert {
            id: uuid::Uuid::new_v4(),
            candidate,
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
        };
        state.alerts.push(persisted.clone());
        Ok(persisted)
    }

    async fn mark_service_activity(&self, service: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.last_seen.insert(service.to_string(), timestamp);
        Ok(())
    }

    async fn list_stale_services(&self, threshold: DateTime<Utc>) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .last_seen
            .iter()
            .filter(|(_, seen)| **seen < threshold)
            .map(|(service, _)| service.clone())
            .collect())
    }

    async fn server_now(&self) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AlertType, Severity, StatsSnapshot};

    fn candidate(service: &str) -> CandidateAlert {
        CandidateAlert {
            service: service.to_string(),
            alert_type: AlertType::ErrorSpike,
            severity: Severity::High,
            message: "test".into(),
            bucket_window_start: Utc::now(),
            stats: StatsSnapshot { mean: 1.0, std_dev: 1.0, value: 10.0, count: 30 },
        }
    }

    #[tokio::test]
    async fn advisory_lock_is_exclusive() {
        let repo = InMemoryRepository::new();
        assert!(repo.try_acquire_advisory_lock(42).await.unwrap());
        assert!(!repo.try_acquire_advisory_lock(42).await.unwrap());
        repo.release_advisory_lock(42).await.unwrap();
        assert!(repo.try_acquire_advisory_lock(42).await.unwrap());
    }

    #[tokio::test]
    async fn count_unresolved_reflects_recent_inserts() {
        let repo = InMemoryRepository::new();
        repo.insert_alert(candidate("api")).await.unwrap();
        let count = repo.count_unresolved_alerts_since("api", "error_spike", 60).await.unwrap();
        assert_eq!(count, 1);
    }
}

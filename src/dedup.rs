// src/dedup.rs
//
// Alert Deduplicator — three layers run in order for each candidate: an
// L1 local cache keyed skew-insensitively by `service:alertType` and
// evicted both by TTL and by LRU size, an L2 Postgres-style advisory
// lock, and an L3 windowed duplicate query against the repository's own
// clock. Grounded in the reference engine's `load_shedder.rs`
// admission-control shape (reject fast on an uncontended local check
// before touching anything shared) generalized from in-process
// contention to cross-replica contention via the repository's advisory
// lock.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{CandidateAlert, PersistedAlert};
use crate::repository::Repository;

fn l1_key(service: &str, alert_type: &str) -> String {
    format!("{service}:{alert_type}")
}

/// First 8 bytes of SHA-256("alert:service:alertType") as a signed
/// big-endian i64, used as the Postgres advisory-lock key.
fn advisory_lock_key(service: &str, alert_type: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(format!("alert:{service}:{alert_type}").as_bytes());
    let digest = hasher.finalize();
    i64::from_be_bytes(digest[0..8].try_into().expect("sha256 digest is 32 bytes"))
}

struct L1Entry {
    last_emission: DateTime<Utc>,
}

pub struct Deduplicator {
    l1: DashMap<String, L1Entry>,
    l1_order: Mutex<VecDeque<String>>,
    repo: Arc<dyn Repository>,
    config: EngineConfig,
}

impl Deduplicator {
    pub fn new(repo: Arc<dyn Repository>, config: EngineConfig) -> Self {
        Self { l1: DashMap::new(), l1_order: Mutex::new(VecDeque::new()), repo, config }
    }

    /// `false` both when there is no L1 entry and when the entry has aged
    /// past `cacheTtlMs` — an expired entry is removed here so it never
    /// influences the LRU eviction order either.
    fn l1_reject(&self, key: &str, now: DateTime<Utc>) -> bool {
        let ttl = ChronoDuration::milliseconds(self.config.cache_ttl_ms);
        let expired = match self.l1.get(key) {
            Some(e) => now - e.last_emission >= ttl,
            None => return false,
        };
        if expired {
            self.l1.remove(key);
            return false;
        }
        let w = ChronoDuration::seconds(self.config.deduplication_window_sec);
        self.l1.get(key).map(|e| (now - e.last_emission).abs() < w).unwrap_or(false)
    }

    async fn l1_record(&self, key: String, now: DateTime<Utc>) {
        self.l1.insert(key.clone(), L1Entry { last_emission: now });
        let mut order = self.l1_order.lock().await;
        order.push_back(key);
        while order.len() > self.config.cache_size {
            if let Some(evicted) = order.pop_front() {
                self.l1.remove(&evicted);
            }
        }
    }

    /// Run a candidate through L1/L2/L3. Returns `Ok(Some(persisted))` if
    /// admitted and written, `Ok(None)` if rejected as a duplicate (or
    /// because another replica holds the lock), and `Err` only for a
    /// genuine repository failure — lock-not-acquired and duplicate-row
    /// rejections are not errors.
    pub async fn try_admit(&self, candidate: CandidateAlert) -> Result<Option<PersistedAlert>> {
        let alert_type = candidate.alert_type.to_string();
        let key = l1_key(&candidate.service, &alert_type);
        let now = Utc::now();

        if self.l1_reject(&key, now) {
            return Ok(None);
        }

        let lock_key = advisory_lock_key(&candidate.service, &alert_type);
        if !self.repo.try_acquire_advisory_lock(lock_key).await? {
            // Another replica owns the decision — availability over
            // strict once-ness.
            return Ok(None);
        }

        let result = self.admit_under_lock(&candidate, &alert_type, &key, now).await;

        if let Err(e) = self.repo.release_advisory_lock(lock_key).await {
            warn!(error = %e, service = %candidate.service, "failed to release advisory lock");
        }

        result
    }

    async fn admit_under_lock(
        &self,
        candidate: &CandidateAlert,
        alert_type: &str,
        l1_key_str: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PersistedAlert>> {
        let window = self.config.l3_window_sec();
        let existing = self
            .repo
            .count_unresolved_alerts_since(&candidate.service, alert_type, window)
            .await?;
        if existing > 0 {
            return Ok(None);
        }

        let persisted = self.repo.insert_alert(candidate.clone()).await?;
        self.l1_record(l1_key_str.to_string(), now).await;
        info!(service = %candidate.service, alert_type = %alert_type, "alert admitted");
        Ok(Some(persisted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AlertType, Severity, StatsSnapshot};
    use crate::repository::InMemoryRepository;

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
    async fn first_candidate_admitted_second_rejected_by_l1() {
        let repo = Arc::new(InMemoryRepository::new());
        let dedup = Deduplicator::new(repo, EngineConfig::default());
        let first = dedup.try_admit(candidate("api")).await.unwrap();
        assert!(first.is_some());
        let second = dedup.try_admit(candidate("api")).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn different_services_are_independent() {
        let repo = Arc::new(InMemoryRepository::new());
        let dedup = Deduplicator::new(repo, EngineConfig::default());
        assert!(dedup.try_admit(candidate("api")).await.unwrap().is_some());
        assert!(dedup.try_admit(candidate("billing")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn advisory_lock_key_is_deterministic() {
        let a = advisory_lock_key("api", "error_spike");
        let b = advisory_lock_key("api", "error_spike");
        let c = advisory_lock_key("api", "high_latency");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

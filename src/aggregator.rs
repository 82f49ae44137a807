// src/aggregator.rs
//
// Metric Aggregator — consumes inbound events, drives the Bucket Store,
// and maintains the Downtime Watcher. Malformed events are dropped at
// this boundary with a counter increment, never propagated as an error,
// matching the way the reference engine's workers return `None` rather
// than `Err` for "no signal / bad input".

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::warn;

use crate::bucket_store::{BucketStore, RawObservation};
use crate::downtime::DowntimeWatcher;
use crate::events::{IngestEvent, Metric};

pub struct Aggregator {
    buckets: BucketStore,
    downtime: DowntimeWatcher,
    pub dropped_events: AtomicU64,
}

impl Aggregator {
    pub fn new(bucket_ms: i64, lag_tolerance_ms: i64, reservoir_capacity: usize) -> Self {
        Self {
            buckets: BucketStore::new(bucket_ms, lag_tolerance_ms, reservoir_capacity),
            downtime: DowntimeWatcher::new(),
            dropped_events: AtomicU64::new(0),
        }
    }

    pub fn downtime(&self) -> &DowntimeWatcher {
        &self.downtime
    }

    /// Process one inbound event, returning any Metrics finalized as a
    /// side effect of this observation.
    pub async fn ingest(&self, event: IngestEvent) -> Vec<Metric> {
        let service = event.service().to_string();
        if service.is_empty() || service.len() > 255 {
            warn!(service_len = service.len(), "dropping event with invalid service key");
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }

        let now = event.timestamp();
        let obs = match &event {
            IngestEvent::Log(log) => RawObservation::Log { is_error: log.level.is_error() },
            IngestEvent::SpanEnd(span) => {
                if span.duration_ms < 0.0 {
                    warn!(service = %service, "dropping span with negative duration");
                    self.dropped_events.fetch_add(1, Ordering::Relaxed);
                    return Vec::new();
                }
                RawObservation::SpanEnd {
                    duration_ms: span.duration_ms,
                    is_error: span.status == crate::events::SpanStatus::Error,
                }
            }
        };

        self.downtime.mark_activity(&service, now);
        self.buckets.observe(&service, obs, now).await
    }

    /// Periodic sweep: force-close aged-out buckets even with no new
    /// traffic, so silence decays the baseline instead of freezing it.
    pub async fn flush_stale(&self) -> Vec<Metric> {
        self.buckets.flush_stale(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LogEvent, LogLevel};
    use chrono::DateTime;

    fn log(service: &str, level: LogLevel, ts_ms: i64) -> IngestEvent {
        IngestEvent::Log(LogEvent {
            timestamp: DateTime::from_timestamp_millis(ts_ms).unwrap(),
            level,
            service: service.to_string(),
            message: "x".into(),
            metadata: None,
            trace_id: None,
            span_id: None,
        })
    }

    #[tokio::test]
    async fn error_and_fatal_increment_error_count() {
        let agg = Aggregator::new(60_000, 0, 64);
        agg.ingest(log("api", LogLevel::Error, 1_000)).await;
        agg.ingest(log("api", LogLevel::Fatal, 2_000)).await;
        let closed = agg.ingest(log("api", LogLevel::Info, 61_000)).await;
        let err = closed
            .iter()
            .find(|m| m.kind == crate::events::MetricKind::ErrorCount)
            .unwrap();
        assert_eq!(err.value, 2.0);
    }

    #[tokio::test]
    async fn empty_service_key_is_dropped() {
        let agg = Aggregator::new(60_000, 0, 64);
        let closed = agg.ingest(log("", LogLevel::Info, 1_000)).await;
        assert!(closed.is_empty());
        assert_eq!(agg.dropped_events.load(Ordering::Relaxed), 1);
    }
}

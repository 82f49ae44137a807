// src/bucket_store.rs
//
// Time Bucket Store — per-service fixed-interval aggregation window,
// sharded by service the way the reference engine shards per-account state
// in `state/window.rs` (`DashMap<String, Arc<Mutex<...>>>`, one lock per
// key, no cross-key contention).
//
// Unlike the reference engine's per-account window (an unbounded event
// ring buffer), this store never retains raw events: it holds only the one
// open Bucket per service, plus a bounded latency reservoir. Everything
// older than the open window has already been finalized into a Metric.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::events::{Metric, MetricKind};

/// Uniform reservoir sampling over a bounded capacity.
#[derive(Debug, Clone)]
pub struct Reservoir {
    capacity: usize,
    samples: Vec<f64>,
    seen: u64,
    rng_state: u64,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Vec::with_capacity(capacity),
            seen: 0,
            rng_state: 0x2545_F491_4F6C_DD1D,
        }
    }

    /// xorshift64* — deterministic, dependency-free, good enough for
    /// reservoir sampling (not cryptographic).
    fn next_u64(&mut self) -> u64 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x
    }

    pub fn push(&mut self, value: f64) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
            return;
        }
        let j = self.next_u64() % self.seen;
        if (j as usize) < self.capacity {
            self.samples[j as usize] = value;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 95th percentile, or 0 if empty. Sorts in place — O(capacity log
    /// capacity), invoked once per bucket close.
    pub fn p95(&mut self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = self.samples.len();
        let idx = ((0.95 * n as f64).ceil() as usize).saturating_sub(1).min(n - 1);
        self.samples[idx]
    }
}

/// A single open or just-closed aggregation window for one service.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub service: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub error_count: u64,
    pub log_count: u64,
    pub request_count: u64,
    pub latency_reservoir: Reservoir,
}

impl Bucket {
    fn new(service: &str, window_start: DateTime<Utc>, bucket_ms: i64, reservoir_capacity: usize) -> Self {
        Self {
            service: service.to_string(),
            window_start,
            window_end: window_start + ChronoDuration::milliseconds(bucket_ms),
            error_count: 0,
            log_count: 0,
            request_count: 0,
            latency_reservoir: Reservoir::new(reservoir_capacity),
        }
    }

    /// Finalize this bucket into its Metrics. Consumes the bucket since a
    /// finalized bucket is immutable and never mutated again.
    pub fn close(mut self, bucket_ms: i64) -> Vec<Metric> {
        let throughput = self.request_count as f64 / (bucket_ms as f64 / 1000.0);
        let latency_p95 = self.latency_reservoir.p95();

        vec![
            Metric {
                service: self.service.clone(),
                kind: MetricKind::ErrorCount,
                value: self.error_count as f64,
                window_start: self.window_start,
                window_end: self.window_end,
            },
            Metric {
                service: self.service.clone(),
                kind: MetricKind::LogCount,
                value: self.log_count as f64,
                window_start: self.window_start,
                window_end: self.window_end,
            },
            Metric {
                service: self.service.clone(),
                kind: MetricKind::RequestCount,
                value: self.request_count as f64,
                window_start: self.window_start,
                window_end: self.window_end,
            },
            Metric {
                service: self.service.clone(),
                kind: MetricKind::Throughput,
                value: throughput,
                window_start: self.window_start,
                window_end: self.window_end,
            },
            Metric {
                service: self.service.clone(),
                kind: MetricKind::LatencyP95,
                value: latency_p95,
                window_start: self.window_start,
                window_end: self.window_end,
            },
        ]
    }
}

/// What the aggregator adds to the currently open bucket for one service.
#[derive(Debug, Clone, Copy)]
pub enum RawObservation {
    Log { is_error: bool },
    SpanEnd { duration_ms: f64, is_error: bool },
}

struct ServiceSlot {
    open: Option<Bucket>,
}

pub struct BucketStore {
    shards: DashMap<String, Arc<Mutex<ServiceSlot>>>,
    bucket_ms: i64,
    lag_tolerance_ms: i64,
    reservoir_capacity: usize,
}

fn floor_to_bucket(now: DateTime<Utc>, bucket_ms: i64) -> DateTime<Utc> {
    let ms = now.timestamp_millis();
    let ws_ms = (ms.div_euclid(bucket_ms)) * bucket_ms;
    DateTime::from_timestamp_millis(ws_ms).unwrap_or(now)
}

impl BucketStore {
    pub fn new(bucket_ms: i64, lag_tolerance_ms: i64, reservoir_capacity: usize) -> Self {
        Self {
            shards: DashMap::new(),
            bucket_ms,
            lag_tolerance_ms,
            reservoir_capacity,
        }
    }

    fn slot(&self, service: &str) -> Arc<Mutex<ServiceSlot>> {
        self.shards
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ServiceSlot { open: None })))
            .clone()
    }

    /// Close `open` and synthesize empty buckets for every missed interval
    /// strictly between it and `new_ws` (exclusive), per the gap policy.
    /// Returns the finalized Metrics for every closed bucket, in window
    /// order, and leaves `slot.open` as `None`.
    fn drain_closed(&self, slot: &mut ServiceSlot, new_ws: DateTime<Utc>) -> Vec<Metric> {
        let mut metrics = Vec::new();
        let Some(cur) = slot.open.take() else { return metrics };

        let service = cur.service.clone();
        let mut next_ws = cur.window_start + ChronoDuration::milliseconds(self.bucket_ms);
        metrics.extend(cur.close(self.bucket_ms));

        while next_ws < new_ws {
            let empty = Bucket::new(&service, next_ws, self.bucket_ms, self.reservoir_capacity);
            metrics.extend(empty.close(self.bucket_ms));
            next_ws += ChronoDuration::milliseconds(self.bucket_ms);
        }

        metrics
    }

    /// Record one observation for `service` at time `now`. Returns the
    /// Metrics for any buckets that closed as a side effect.
    pub async fn observe(&self, service: &str, obs: RawObservation, now: DateTime<Utc>) -> Vec<Metric> {
        let ws = floor_to_bucket(now, self.bucket_ms);
        let slot = self.slot(service);
        let mut guard = slot.lock().await;

        let mut metrics = Vec::new();
        match &guard.open {
            None => {
                guard.open = Some(Bucket::new(service, ws, self.bucket_ms, self.reservoir_capacity));
            }
            Some(cur) if cur.window_start < ws => {
                metrics = self.drain_closed(&mut guard, ws);
                guard.open = Some(Bucket::new(service, ws, self.bucket_ms, self.reservoir_capacity));
            }
            Some(cur) if cur.window_start > ws => {
                // Event arrived for a window that has already closed —
                // treated as a dropped late event, not applied.
                return metrics;
            }
            _ => {}
        }

        let bucket = guard.open.as_mut().expect("bucket just ensured open");
        match obs {
            RawObservation::Log { is_error } => {
                bucket.log_count += 1;
                if is_error {
                    bucket.error_count += 1;
                }
            }
            RawObservation::SpanEnd { duration_ms, is_error } => {
                bucket.request_count += 1;
                bucket.latency_reservoir.push(duration_ms);
                if is_error {
                    bucket.error_count += 1;
                }
            }
        }

        metrics
    }

    /// Force-close any bucket that has aged past its lag tolerance, even
    /// without a new observation arriving. This is what lets silence decay
    /// the baseline and feed the downtime watcher instead of only
    /// advancing on the next real event.
    pub async fn flush_stale(&self, now: DateTime<Utc>) -> Vec<Metric> {
        let mut all = Vec::new();
        let keys: Vec<String> = self.shards.iter().map(|e| e.key().clone()).collect();
        for service in keys {
            let slot = self.slot(&service);
            let mut guard = slot.lock().await;
            if let Some(cur) = &guard.open {
                let deadline = cur.window_end + ChronoDuration::milliseconds(self.lag_tolerance_ms);
                if now >= deadline {
                    let ws = floor_to_bucket(now, self.bucket_ms);
                    all.extend(self.drain_closed(&mut guard, ws));
                }
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn t(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    proptest! {
        /// `floor_to_bucket` always returns a multiple of `bucket_ms` no
        /// greater than the input instant, for arbitrary timestamps and
        /// bucket widths.
        #[test]
        fn floor_to_bucket_is_always_aligned(ms in 0i64..10_000_000_000, bucket_ms in 1_000i64..600_000) {
            let now = t(ms);
            let ws = floor_to_bucket(now, bucket_ms);
            prop_assert_eq!(ws.timestamp_millis() % bucket_ms, 0);
            prop_assert!(ws.timestamp_millis() <= ms);
        }
    }

    #[tokio::test]
    async fn single_bucket_accumulates() {
        let store = BucketStore::new(60_000, 2_000, 64);
        let m1 = store.observe("api", RawObservation::Log { is_error: false }, t(1_000)).await;
        assert!(m1.is_empty());
        let m2 = store
            .observe("api", RawObservation::SpanEnd { duration_ms: 10.0, is_error: true }, t(2_000))
            .await;
        assert!(m2.is_empty());
    }

    #[tokio::test]
    async fn bucket_close_emits_five_metrics() {
        let store = BucketStore::new(60_000, 0, 64);
        store.observe("api", RawObservation::Log { is_error: true }, t(1_000)).await;
        let closed = store.observe("api", RawObservation::Log { is_error: false }, t(61_000)).await;
        assert_eq!(closed.len(), 5);
        let err = closed.iter().find(|m| m.kind == MetricKind::ErrorCount).unwrap();
        assert_eq!(err.value, 1.0);
        assert_eq!(err.window_start, t(0));
        assert_eq!(err.window_end, t(60_000));
    }

    #[tokio::test]
    async fn gap_synthesizes_empty_buckets() {
        let store = BucketStore::new(60_000, 0, 64);
        store.observe("api", RawObservation::Log { is_error: false }, t(1_000)).await;
        // Jump forward 3 buckets of silence.
        let closed = store
            .observe("api", RawObservation::Log { is_error: false }, t(3 * 60_000 + 5_000))
            .await;
        // 3 closed buckets (original + 2 synthetic empty) * 5 metric kinds.
        assert_eq!(closed.len(), 15);
        let error_metrics: Vec<_> = closed.iter().filter(|m| m.kind == MetricKind::ErrorCount).collect();
        assert_eq!(error_metrics.len(), 3);
        assert!(error_metrics[1].value == 0.0 && error_metrics[2].value == 0.0);
    }

    #[tokio::test]
    async fn window_starts_are_contiguous_multiples_of_bucket_ms() {
        let store = BucketStore::new(60_000, 0, 64);
        store.observe("api", RawObservation::Log { is_error: false }, t(500)).await;
        let closed = store
            .observe("api", RawObservation::Log { is_error: false }, t(5 * 60_000))
            .await;
        let mut starts: Vec<i64> = closed
            .iter()
            .filter(|m| m.kind == MetricKind::ErrorCount)
            .map(|m| m.window_start.timestamp_millis())
            .collect();
        starts.sort_unstable();
        for w in starts.windows(2) {
            assert_eq!(w[1] - w[0], 60_000);
        }
        for s in &starts {
            assert_eq!(s % 60_000, 0);
        }
    }
}

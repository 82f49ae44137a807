// src/shard.rs
//
// Per-service admission control and backpressure. Mirrors the reference
// engine's `load_shedder.rs` watermark-and-counter shape, simplified from
// its four-tier priority scheme down to a single queue-depth threshold:
// once a service's in-flight count exceeds `maxQueueDepth`, further
// events for that service are dropped with a counter increment rather
// than queued unboundedly.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

pub struct AdmissionControl {
    in_flight: DashMap<String, Arc<AtomicUsize>>,
    max_queue_depth: usize,
    pub dropped_total: AtomicU64,
}

/// Released automatically when the admitted event finishes processing,
/// decrementing that service's in-flight count.
pub struct AdmissionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AdmissionControl {
    pub fn new(max_queue_depth: usize) -> Self {
        Self {
            in_flight: DashMap::new(),
            max_queue_depth,
            dropped_total: AtomicU64::new(0),
        }
    }

    fn counter(&self, service: &str) -> Arc<AtomicUsize> {
        self.in_flight
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    /// Admit one event for `service`. Returns `None` (and increments
    /// `dropped_total`) if that service's shard is already at capacity.
    pub fn try_admit(&self, service: &str) -> Option<AdmissionGuard> {
        let counter = self.counter(service);
        let depth = counter.fetch_add(1, Ordering::AcqRel);
        if depth >= self.max_queue_depth {
            counter.fetch_sub(1, Ordering::AcqRel);
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(AdmissionGuard { counter })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_depth_then_drops() {
        let control = AdmissionControl::new(2);
        let g1 = control.try_admit("api");
        let g2 = control.try_admit("api");
        assert!(g1.is_some());
        assert!(g2.is_some());
        assert!(control.try_admit("api").is_none());
        assert_eq!(control.dropped_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn releasing_a_guard_frees_capacity() {
        let control = AdmissionControl::new(1);
        let guard = control.try_admit("api").unwrap();
        assert!(control.try_admit("api").is_none());
        drop(guard);
        assert!(control.try_admit("api").is_some());
    }

    #[test]
    fn shards_are_independent() {
        let control = AdmissionControl::new(1);
        let _g = control.try_admit("api").unwrap();
        assert!(control.try_admit("billing").is_some());
    }
}

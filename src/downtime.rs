// src/downtime.rs
//
// Downtime Watcher — per-service last-observation timestamp, consulted by
// a periodic sweep to raise `service_down` alerts. Maintained from any
// observed event, the way the reference engine's StateStore tracks
// `last_seen` on every `AccountWindow` — but kept as its own small
// concurrent map, a distinct entity from the Bucket/Baseline state.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;

pub struct DowntimeWatcher {
    last_seen: DashMap<String, DateTime<Utc>>,
    rearmed_after_alert: DashMap<String, bool>,
}

impl DowntimeWatcher {
    pub fn new() -> Self {
        Self {
            last_seen: DashMap::new(),
            rearmed_after_alert: DashMap::new(),
        }
    }

    pub fn mark_activity(&self, service: &str, now: DateTime<Utc>) {
        self.last_seen.insert(service.to_string(), now);
        // Fresh activity is what re-arms the watcher, not alert resolution
        // — see the Open Question resolution in DESIGN.md.
        self.rearmed_after_alert.insert(service.to_string(), true);
    }

    /// Services whose last observation is at least `threshold_minutes` old.
    pub fn list_stale(&self, now: DateTime<Utc>, threshold_minutes: i64) -> Vec<String> {
        let threshold = ChronoDuration::minutes(threshold_minutes);
        self.last_seen
            .iter()
            .filter(|e| now - *e.value() >= threshold)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Consumed by the sweep once it has emitted a `service_down` alert for
    /// this service, so the same silence doesn't re-arm immediately.
    pub fn mark_alerted(&self, service: &str) {
        self.rearmed_after_alert.insert(service.to_string(), false);
    }

    pub fn can_rearm(&self, service: &str) -> bool {
        self.rearmed_after_alert.get(service).map(|v| *v).unwrap_or(true)
    }
}

impl Default for DowntimeWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_after_threshold() {
        let watcher = DowntimeWatcher::new();
        let t0 = Utc::now();
        watcher.mark_activity("worker-7", t0);
        assert!(watcher.list_stale(t0 + ChronoDuration::minutes(4), 5).is_empty());
        assert_eq!(
            watcher.list_stale(t0 + ChronoDuration::minutes(5), 5),
            vec!["worker-7".to_string()]
        );
    }

    #[test]
    fn rearm_requires_fresh_activity_not_alert_resolution() {
        let watcher = DowntimeWatcher::new();
        let t0 = Utc::now();
        watcher.mark_activity("svc", t0);
        watcher.mark_alerted("svc");
        assert!(!watcher.can_rearm("svc"));
        watcher.mark_activity("svc", t0 + ChronoDuration::minutes(1));
        assert!(watcher.can_rearm("svc"));
    }
}

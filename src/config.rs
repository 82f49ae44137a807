// src/config.rs
//
// Immutable engine configuration, constructed once at startup and shared
// by `Arc` with every component. Runtime updates require a rebuild — see
// the "global mutable configuration" design note.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Aggregation interval in milliseconds.
    pub bucket_ms: i64,
    /// How long after `window_end` a bucket stays open for late data.
    pub lag_tolerance_ms: i64,
    /// Rolling baseline length, in finalized buckets.
    pub baseline_window_buckets: usize,
    /// Short-range tail length used for rate-of-change.
    pub roc_window_buckets: usize,

    pub z_threshold: f64,
    pub min_data_points: usize,
    pub rate_change_threshold: f64,
    pub min_rate_for_roc: f64,

    pub cooldown_seconds: i64,
    pub alert_retry_attempts: u32,

    pub deduplication_window_sec: i64,
    pub max_clock_skew_sec: i64,
    pub lock_timeout_ms: u64,
    pub cache_size: usize,
    pub cache_ttl_ms: i64,

    pub service_downtime_minutes: i64,

    pub error_count_threshold: f64,
    pub latency_threshold_ms: f64,

    /// Uniform reservoir capacity for the latency percentile estimator.
    pub latency_reservoir_capacity: usize,
    /// Inbound admission-control queue depth per shard.
    pub max_queue_depth: usize,

    /// Use Median Absolute Deviation instead of stdDev in the baseline.
    pub robust_baseline: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bucket_ms: 60_000,
            lag_tolerance_ms: 2_000,
            baseline_window_buckets: 60,
            roc_window_buckets: 5,

            z_threshold: 3.0,
            min_data_points: 30,
            rate_change_threshold: 0.5,
            min_rate_for_roc: 0.1,

            cooldown_seconds: 120,
            alert_retry_attempts: 3,

            deduplication_window_sec: 5,
            max_clock_skew_sec: 3,
            lock_timeout_ms: 1_000,
            cache_size: 1_000,
            cache_ttl_ms: 10_000,

            service_downtime_minutes: 5,

            error_count_threshold: 10.0,
            latency_threshold_ms: 1_000.0,

            latency_reservoir_capacity: 1_024,
            max_queue_depth: 100_000,

            robust_baseline: false,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| EngineError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn l3_window_sec(&self) -> i64 {
        self.deduplication_window_sec + 2 * self.max_clock_skew_sec
    }
}

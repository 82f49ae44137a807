// src/detector.rs
//
// Anomaly Detector — evaluates each finalized Metric against its Baseline
// using two independent rules, maps a firing rule to a CandidateAlert,
// and suppresses repeats with a per-(service, alertType) cooldown state
// machine. Grounded in the reference engine's `engine/fusion.rs`
// (DashMap-keyed per-key cooldown state, `DateTime<Utc>` comparisons
// instead of a literal state enum).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tracing::info;

use crate::baseline::{Baseline, BaselineSnapshot, RuleKind};
use crate::config::EngineConfig;
use crate::events::{AlertType, CandidateAlert, Metric, MetricKind, Severity, StatsSnapshot};

const EPS_REL: f64 = 0.01;
const EPS_ABS: f64 = 0.1;

fn rule_kind_for(kind: MetricKind) -> Option<RuleKind> {
    match kind {
        MetricKind::ErrorCount => Some(RuleKind::ErrorCount),
        MetricKind::LatencyP95 => Some(RuleKind::LatencyP95),
        _ => None,
    }
}

fn alert_type_for(kind: RuleKind) -> AlertType {
    match kind {
        RuleKind::ErrorCount => AlertType::ErrorSpike,
        RuleKind::LatencyP95 => AlertType::HighLatency,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CooldownState {
    Quiet,
    Cooling(i64), // lastEmittedAt, ms since epoch
}

struct DetectorKeyState {
    baseline: Baseline,
    cooldown: CooldownState,
}

/// Evaluates Rule A (z-score) and Rule B (rate of change) per
/// (service, ruleKind), with a static fallback when the baseline hasn't
/// accumulated `minDataPoints` samples yet.
pub struct Detector {
    states: DashMap<(String, RuleKind), DetectorKeyState>,
    config: EngineConfig,
}

impl Detector {
    pub fn new(config: EngineConfig) -> Self {
        Self { states: DashMap::new(), config }
    }

    fn entry(&self, service: &str, kind: RuleKind) -> dashmap::mapref::one::RefMut<'_, (String, RuleKind), DetectorKeyState> {
        self.states
            .entry((service.to_string(), kind))
            .or_insert_with(|| DetectorKeyState {
                baseline: Baseline::new(
                    self.config.baseline_window_buckets,
                    self.config.roc_window_buckets,
                    0.3,
                    self.config.robust_baseline,
                ),
                cooldown: CooldownState::Quiet,
            })
    }

    /// Feed one finalized Metric through the detector. Returns a
    /// CandidateAlert if a rule fired and the cooldown for this
    /// (service, alertType) key allows emission.
    pub fn evaluate(&self, metric: &Metric) -> Option<CandidateAlert> {
        let rule_kind = rule_kind_for(metric.kind)?;
        let mut state = self.entry(&metric.service, rule_kind);

        // Evaluate against the history accumulated so far, then fold this
        // value in — comparing a value against a baseline that already
        // contains it dilutes the very deviation being measured.
        let snapshot = state.baseline.snapshot();
        let fallback_threshold = match rule_kind {
            RuleKind::ErrorCount => self.config.error_count_threshold,
            RuleKind::LatencyP95 => self.config.latency_threshold_ms,
        };

        let fired = self.evaluate_rules(metric.value, &snapshot, fallback_threshold, rule_kind);
        state.baseline.push(metric.value);
        let Some((severity, message)) = fired else {
            return None;
        };

        let alert_type = alert_type_for(rule_kind);
        let now_ms = metric.window_end.timestamp_millis();
        if let CooldownState::Cooling(last) = state.cooldown {
            if now_ms - last < self.config.cooldown_seconds * 1000 {
                return None;
            }
        }
        state.cooldown = CooldownState::Cooling(now_ms);

        info!(
            service = %metric.service,
            alert_type = %alert_type,
            severity = %severity,
            "candidate alert fired"
        );

        Some(CandidateAlert {
            service: metric.service.clone(),
            alert_type,
            severity,
            message,
            bucket_window_start: metric.window_start,
            stats: StatsSnapshot {
                mean: snapshot.mean,
                std_dev: snapshot.std_dev,
                value: metric.value,
                count: snapshot.count,
            },
        })
    }

    fn evaluate_rules(
        &self,
        value: f64,
        snapshot: &BaselineSnapshot,
        fallback_threshold: f64,
        rule_kind: RuleKind,
    ) -> Option<(Severity, String)> {
        if snapshot.count < self.config.min_data_points {
            // Static fallback: not enough samples to trust the learned
            // baseline yet.
            if value >= fallback_threshold {
                return Some((
                    Severity::Medium,
                    format!("{value} exceeds static fallback threshold {fallback_threshold}"),
                ));
            }
            return None;
        }

        if let Some(result) = self.rule_a(value, snapshot) {
            return Some(result);
        }
        self.rule_b(value, snapshot, rule_kind)
    }

    /// Rule A — z-score deviation.
    fn rule_a(&self, value: f64, snapshot: &BaselineSnapshot) -> Option<(Severity, String)> {
        if value <= snapshot.mean {
            return None;
        }
        let denom = snapshot.spread.max(EPS_REL * snapshot.mean + EPS_ABS);
        let z = (value - snapshot.mean) / denom;
        if z < self.config.z_threshold {
            return None;
        }
        let severity = if z >= 6.0 {
            Severity::Critical
        } else if z >= 4.0 {
            Severity::High
        } else {
            Severity::Medium
        };
        Some((severity, format!("z-score {z:.2} exceeds threshold {}", self.config.z_threshold)))
    }

    /// Rule B — rate of change against the short tail window.
    fn rule_b(&self, value: f64, snapshot: &BaselineSnapshot, rule_kind: RuleKind) -> Option<(Severity, String)> {
        let _ = rule_kind;
        if snapshot.recent_mean < self.config.min_rate_for_roc {
            return None;
        }
        let ratio = value / snapshot.recent_mean;
        if ratio < 1.0 + self.config.rate_change_threshold {
            return None;
        }
        let severity = if ratio >= 3.0 {
            Severity::Critical
        } else if ratio >= 2.0 {
            Severity::High
        } else {
            Severity::Medium
        };
        Some((severity, format!("rate of change {ratio:.2}x exceeds threshold")))
    }
}

/// Advance the cooldown for (service, alertType) from `Cooling` back to
/// `Quiet` once `cooldown_seconds` has elapsed, purely for observability —
/// `evaluate` already re-derives this from the timestamp delta, so this
/// is informational bookkeeping for anything inspecting detector state
/// between evaluations (e.g. a metrics exporter).
pub fn is_quiescent(last_emitted_at: DateTime<Utc>, now: DateTime<Utc>, cooldown_seconds: i64) -> bool {
    now - last_emitted_at >= ChronoDuration::seconds(cooldown_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metric(service: &str, kind: MetricKind, value: f64, ws_ms: i64) -> Metric {
        let ws = Utc.timestamp_millis_opt(ws_ms).unwrap();
        Metric {
            service: service.to_string(),
            kind,
            value,
            window_start: ws,
            window_end: ws + ChronoDuration::milliseconds(60_000),
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn z_score_fires_only_above_mean() {
        let d = Detector::new(config());
        for i in 0..30 {
            d.evaluate(&metric("api", MetricKind::ErrorCount, 1.0, i * 60_000));
        }
        let candidate = d.evaluate(&metric("api", MetricKind::ErrorCount, 0.0, 30 * 60_000));
        assert!(candidate.is_none());
    }

    /// The z-score threshold is boundary-inclusive: z exactly at
    /// `zThreshold` fires, at severity `medium`.
    #[test]
    fn rule_a_fires_at_exact_z_threshold_boundary() {
        let d = Detector::new(config());
        let snapshot = BaselineSnapshot { mean: 10.0, std_dev: 2.0, spread: 2.0, count: 30, recent_mean: 10.0, ema: 10.0 };
        let value = snapshot.mean + config().z_threshold * snapshot.std_dev; // z == 3.0 exactly
        let fired = d.rule_a(value, &snapshot);
        assert!(fired.is_some());
        assert_eq!(fired.unwrap().0, Severity::Medium);
    }

    /// Just under the threshold never fires.
    #[test]
    fn rule_a_does_not_fire_just_below_z_threshold() {
        let d = Detector::new(config());
        let snapshot = BaselineSnapshot { mean: 10.0, std_dev: 2.0, spread: 2.0, count: 30, recent_mean: 10.0, ema: 10.0 };
        let value = snapshot.mean + (config().z_threshold - 0.01) * snapshot.std_dev;
        assert!(d.rule_a(value, &snapshot).is_none());
    }

    #[test]
    fn static_fallback_fires_with_insufficient_history() {
        let d = Detector::new(config());
        // Feed zeros, fewer than min_data_points.
        for i in 0..5 {
            d.evaluate(&metric("billing", MetricKind::ErrorCount, 0.0, i * 60_000));
        }
        let candidate = d.evaluate(&metric("billing", MetricKind::ErrorCount, 15.0, 5 * 60_000));
        assert!(candidate.is_some());
        assert_eq!(candidate.unwrap().alert_type, AlertType::ErrorSpike);
    }

    #[test]
    fn cooldown_suppresses_repeat_within_window() {
        let d = Detector::new(config());
        for i in 0..35 {
            d.evaluate(&metric("api", MetricKind::ErrorCount, 1.0, i * 60_000));
        }
        let first = d.evaluate(&metric("api", MetricKind::ErrorCount, 100.0, 35 * 60_000));
        assert!(first.is_some());
        let second = d.evaluate(&metric("api", MetricKind::ErrorCount, 100.0, 35 * 60_000 + 1_000));
        assert!(second.is_none());
    }

    #[test]
    fn severity_escalates_with_z_score() {
        let d = Detector::new(config());
        for i in 0..30 {
            d.evaluate(&metric("api", MetricKind::ErrorCount, 2.0, i * 60_000));
        }
        let candidate = d.evaluate(&metric("api", MetricKind::ErrorCount, 500.0, 30 * 60_000)).unwrap();
        assert_eq!(candidate.severity, Severity::Critical);
    }
}

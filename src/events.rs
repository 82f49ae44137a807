// src/events.rs
//
// Shared domain types flowing through the engine: inbound events, the
// finalized Metric type, and the candidate/persisted alert types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Inbound events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn is_error(self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Fatal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub service: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
    Unset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanEndEvent {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    pub service: String,
    pub name: String,
    pub kind: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: f64,
    pub status: SpanStatus,
    #[serde(default)]
    pub attributes: Option<HashMap<String, serde_json::Value>>,
}

/// The two inbound message shapes, batched over an in-process channel.
/// Untagged so a JSONL line is a bare `LogEvent`/`SpanEndEvent` object
/// (camelCase fields) rather than requiring an external `{"Log": {...}}`
/// wrapper — the shape a tailed or replayed event log is actually written
/// in. Serde tries `Log` first, falling back to `SpanEnd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IngestEvent {
    Log(LogEvent),
    SpanEnd(SpanEndEvent),
}

impl IngestEvent {
    pub fn service(&self) -> &str {
        match self {
            IngestEvent::Log(e) => &e.service,
            IngestEvent::SpanEnd(e) => &e.service,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            IngestEvent::Log(e) => e.timestamp,
            IngestEvent::SpanEnd(e) => e.end_time,
        }
    }
}

// ── Metrics ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    ErrorCount,
    LogCount,
    LatencyP95,
    RequestCount,
    Throughput,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MetricKind::ErrorCount => "error_count",
            MetricKind::LogCount => "log_count",
            MetricKind::LatencyP95 => "latency_p95",
            MetricKind::RequestCount => "request_count",
            MetricKind::Throughput => "throughput",
        };
        write!(f, "{s}")
    }
}

/// The finalized, immutable output of a closed bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub service: String,
    pub kind: MetricKind,
    pub value: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

// ── Alerts ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ErrorSpike,
    HighLatency,
    ServiceDown,
    ThresholdExceeded,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertType::ErrorSpike => "error_spike",
            AlertType::HighLatency => "high_latency",
            AlertType::ServiceDown => "service_down",
            AlertType::ThresholdExceeded => "threshold_exceeded",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// A snapshot of the baseline statistics used to compose an alert message,
/// preserved on the candidate for display and for tests asserting on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub mean: f64,
    pub std_dev: f64,
    pub value: f64,
    pub count: usize,
}

/// Ephemeral detector output, before deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateAlert {
    pub service: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub bucket_window_start: DateTime<Utc>,
    pub stats: StatsSnapshot,
}

/// Candidate + identity assigned by the repository on successful insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedAlert {
    pub id: uuid::Uuid,
    pub candidate: CandidateAlert,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

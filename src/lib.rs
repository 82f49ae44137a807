// src/lib.rs
//
// sentryflow-core: the streaming anomaly detection and alert
// deduplication engine at the heart of the sentryflow observability
// platform. See each module for its place in the pipeline:
// ingest -> Aggregator -> BucketStore -> Detector/Baseline -> Dedup -> Sink.

pub mod aggregator;
pub mod baseline;
pub mod bucket_store;
pub mod bus;
pub mod config;
pub mod dedup;
pub mod detector;
pub mod downtime;
pub mod error;
pub mod events;
pub mod repository;
pub mod repository_pg;
pub mod shard;
pub mod sink;

use std::sync::Arc;

use tracing::{info, warn};

use aggregator::Aggregator;
use bus::EventBus;
use config::EngineConfig;
use dedup::Deduplicator;
use detector::Detector;
use events::{IngestEvent, Metric};
use repository::Repository;
use shard::AdmissionControl;
use sink::AlertSink;

/// Wires the core components together into the single entry point the CLI
/// and any embedder calls per inbound event: admission control, bucket
/// aggregation, metric persistence, detector evaluation, and alert dispatch.
pub struct Engine {
    aggregator: Aggregator,
    detector: Detector,
    sink: AlertSink,
    admission: AdmissionControl,
    repo: Arc<dyn Repository>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig, repo: Arc<dyn Repository>) -> Self {
        let bus = Arc::new(EventBus::default());
        let dedup = Arc::new(Deduplicator::new(repo.clone(), config.clone()));
        Self {
            aggregator: Aggregator::new(config.bucket_ms, config.lag_tolerance_ms, config.latency_reservoir_capacity),
            detector: Detector::new(config.clone()),
            sink: AlertSink::new(dedup, bus, config.alert_retry_attempts),
            admission: AdmissionControl::new(config.max_queue_depth),
            repo,
            config,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        // Exposed so the CLI can subscribe independently of the sink's
        // own handle.
        self.sink.bus()
    }

    /// Write a batch of finalized metrics to the repository, retrying
    /// transient failures with backoff up to `alertRetryAttempts`.
    async fn persist_metrics(&self, metrics: &[Metric]) {
        if metrics.is_empty() {
            return;
        }
        let repo = self.repo.clone();
        let batch = metrics.to_vec();
        let attempts = self.config.alert_retry_attempts;
        let result = error::retry_with_backoff(attempts, move || {
            let repo = repo.clone();
            let batch = batch.clone();
            async move { repo.insert_metrics_batch(&batch).await }
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, count = metrics.len(), "metric batch write failed after retries exhausted");
        }
    }

    /// Process one inbound event end to end: admission control, bucket
    /// aggregation, metric persistence, detector evaluation, and sink
    /// dispatch for any resulting candidate alerts.
    pub async fn ingest(&self, event: IngestEvent) {
        let service = event.service().to_string();
        let Some(_guard) = self.admission.try_admit(&service) else {
            return;
        };

        let metrics = self.aggregator.ingest(event).await;
        self.persist_metrics(&metrics).await;
        for metric in &metrics {
            info!(service = %metric.service, kind = %metric.kind, value = metric.value, "bucket closed");
            self.sink.bus().publish(bus::BusEvent::MetricAggregated(metric.clone()));
            if let Some(candidate) = self.detector.evaluate(metric) {
                self.sink.submit(candidate).await;
            }
        }
    }

    /// Periodic sweep: force-close aged-out buckets and raise
    /// `service_down` candidates for services past `serviceDowntimeMinutes`
    /// of silence.
    pub async fn tick(&self) {
        let metrics = self.aggregator.flush_stale().await;
        self.persist_metrics(&metrics).await;
        for metric in &metrics {
            self.sink.bus().publish(bus::BusEvent::MetricAggregated(metric.clone()));
            if let Some(candidate) = self.detector.evaluate(metric) {
                self.sink.submit(candidate).await;
            }
        }

        let now = chrono::Utc::now();
        for service in self.aggregator.downtime().list_stale(now, self.config.service_downtime_minutes) {
            if !self.aggregator.downtime().can_rearm(&service) {
                continue;
            }
            let candidate = events::CandidateAlert {
                service: service.clone(),
                alert_type: events::AlertType::ServiceDown,
                severity: events::Severity::High,
                message: format!("{service} has not reported activity in {} minutes", self.config.service_downtime_minutes),
                bucket_window_start: now,
                stats: events::StatsSnapshot { mean: 0.0, std_dev: 0.0, value: 0.0, count: 0 },
            };
            if self.sink.submit(candidate).await.is_some() {
                self.aggregator.downtime().mark_alerted(&service);
            }
        }
    }
}

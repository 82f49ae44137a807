// src/repository_pg.rs
//
// Postgres-backed `Repository`, used when `--database-url` is given.
// Advisory locks map directly onto `pg_try_advisory_lock` /
// `pg_advisory_unlock`, and the windowed duplicate query reads the
// database's own clock via `NOW()` rather than the processor's, matching
// the reference engine's `sqlx` usage pattern elsewhere in the pack
// (connection pool built once at startup, queries as `query!`-style bound
// parameters).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{EngineError, Result};
use crate::events::{CandidateAlert, Metric, PersistedAlert};
use crate::repository::Repository;

pub struct PostgresRepository {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PostgresRepository {
    pub async fn connect(database_url: &str, lock_timeout_ms: u64) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| EngineError::Repository(e.to_string()))?;
        Ok(Self { pool, lock_timeout_ms })
    }

    /// Applies the persisted-state schema. Idempotent; safe to call on
    /// every startup.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                service TEXT NOT NULL,
                metric_kind TEXT NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                window_start TIMESTAMPTZ NOT NULL,
                window_end TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (service, metric_kind, window_start)
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id UUID PRIMARY KEY,
                service TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                bucket_window_start TIMESTAMPTZ NOT NULL,
                stats_mean DOUBLE PRECISION NOT NULL,
                stats_std_dev DOUBLE PRECISION NOT NULL,
                stats_value DOUBLE PRECISION NOT NULL,
                stats_count BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                resolved BOOLEAN NOT NULL DEFAULT FALSE,
                resolved_at TIMESTAMPTZ
            );

            CREATE TABLE IF NOT EXISTS service_activity (
                service TEXT PRIMARY KEY,
                last_seen TIMESTAMPTZ NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Repository(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn insert_metrics_batch(&self, metrics: &[Metric]) -> Result<()> {
        for m in metrics {
            sqlx::query(
                r#"
                INSERT INTO metrics (service, metric_kind, value, window_start, window_end)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (service, metric_kind, window_start) DO UPDATE
                SET value = EXCLUDED.value, window_end = EXCLUDED.window_end
                "#,
            )
            .bind(&m.service)
            .bind(m.kind.to_string())
            .bind(m.value)
            .bind(m.window_start)
            .bind(m.window_end)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Repository(e.to_string()))?;
        }
        Ok(())
    }

    /// A deadline hit here (after `lockTimeoutMs`) is treated identically
    /// to "lock not acquired" rather than propagated as an error.
    async fn try_acquire_advisory_lock(&self, key: i64) -> Result<bool> {
        let query = sqlx::query_as("SELECT pg_try_advisory_lock($1)").bind(key).fetch_one(&self.pool);
        match tokio::time::timeout(std::time::Duration::from_millis(self.lock_timeout_ms), query).await {
            Ok(Ok(row)) => {
                let (acquired,): (bool,) = row;
                Ok(acquired)
            }
            Ok(Err(e)) => Err(EngineError::Repository(e.to_string())),
            Err(_elapsed) => Ok(false),
        }
    }

    async fn release_advisory_lock(&self, key: i64) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn count_unresolved_alerts_since(
        &self,
        service: &str,
        alert_type: &str,
        db_interval_seconds: i64,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM alerts
            WHERE service = $1 AND alert_type = $2 AND NOT resolved
              AND created_at > NOW() - ($3 || ' seconds')::interval
            "#,
        )
        .bind(service)
        .bind(alert_type)
        .bind(db_interval_seconds.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EngineError::Repository(e.to_string()))?;
        Ok(row.0)
    }

    async fn insert_alert(&self, candidate: CandidateAlert) -> Result<PersistedAlert> {
        let id = uuid::Uuid::new_v4();
        let row: (DateTime<Utc>,) = sqlx::query_as(
            r#"
            INSERT INTO alerts
                (id, service, alert_type, severity, message, bucket_window_start,
                 stats_mean, stats_std_dev, stats_value, stats_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING created_at
            "#,
        )
        .bind(id)
        .bind(&candidate.service)
        .bind(candidate.alert_type.to_string())
        .bind(candidate.severity.to_string())
        .bind(&candidate.message)
        .bind(candidate.bucket_window_start)
        .bind(candidate.stats.mean)
        .bind(candidate.stats.std_dev)
        .bind(candidate.stats.value)
        .bind(candidate.stats.count as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EngineError::Repository(e.to_string()))?;

        Ok(PersistedAlert { id, candidate, created_at: row.0, resolved: false, resolved_at: None })
    }

    async fn mark_service_activity(&self, service: &str, timestamp: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_activity (service, last_seen) VALUES ($1, $2)
            ON CONFLICT (service) DO UPDATE SET last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(service)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn list_stale_services(&self, threshold: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT service FROM service_activity WHERE last_seen < $1")
            .bind(threshold)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::Repository(e.to_string()))?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn server_now(&self) -> Result<DateTime<Utc>> {
        let row: (DateTime<Utc>,) = sqlx::query_as("SELECT NOW()")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EngineError::Repository(e.to_string()))?;
        Ok(row.0)
    }
}

//! Postgres-backed metric store
//!
//! Run log entries and metric points are insert-only. The serving state is a
//! single row updated with a version predicate, so a promotion either lands
//! whole or not at all.

use super::MetricStore;
use crate::audit::{RunLogEntry, GENESIS_DIGEST};
use crate::error::OrchestrationError;
use crate::models::{MetricDatum, RunVerdict, ServingState, TrainingRun};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

const SERVING_STATE_ROW: i16 = 1;

pub struct PostgresMetricStore {
    pool: PgPool,
    seed: ServingState,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresMetricStore {
    /// Build a store on a lazily connecting pool. `seed` is written only when
    /// no serving state exists yet.
    pub fn connect_lazy(database_url: &str, seed: ServingState) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to configure postgres pool: {}",
                    e
                ))
            })?;

        info!("Metric store backend: postgres");

        Ok(Self {
            pool,
            seed,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    async fn ensure_schema(&self) -> Result<()> {
        let seed_json = serde_json::to_string(&self.seed)?;

        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS retrain_run_log (
                      seq BIGINT PRIMARY KEY,
                      run_id UUID NOT NULL,
                      verdict TEXT NOT NULL,
                      recorded_at TIMESTAMPTZ NOT NULL,
                      record TEXT NOT NULL,
                      prev_digest TEXT NOT NULL,
                      digest TEXT NOT NULL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_retrain_run_log_run
                    ON retrain_run_log (run_id, seq);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS retrain_serving_state (
                      id SMALLINT PRIMARY KEY,
                      version BIGINT NOT NULL,
                      record TEXT NOT NULL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS retrain_metrics (
                      id BIGSERIAL PRIMARY KEY,
                      name TEXT NOT NULL,
                      value DOUBLE PRECISION NOT NULL,
                      tags TEXT NOT NULL,
                      recorded_at TIMESTAMPTZ NOT NULL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO retrain_serving_state (id, version, record)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(SERVING_STATE_ROW)
                .bind(self.seed.version as i64)
                .bind(&seed_json)
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to initialize metric store schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl MetricStore for PostgresMetricStore {
    async fn append_run(&self, run: &TrainingRun) -> Result<u64> {
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await?;

        // Serialize appenders so the digest chain stays linear
        sqlx::query("LOCK TABLE retrain_run_log IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let previous_verdict: Option<String> = sqlx::query(
            "SELECT verdict FROM retrain_run_log WHERE run_id = $1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(run.run_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get("verdict"))
        .transpose()?;

        if let Some(verdict) = previous_verdict {
            if verdict != RunVerdict::Pending.to_string() {
                return Err(OrchestrationError::RunFinalized(run.run_id));
            }
        }

        let tail = sqlx::query("SELECT seq, digest FROM retrain_run_log ORDER BY seq DESC LIMIT 1")
            .fetch_optional(&mut *tx)
            .await?;

        let (prev_seq, prev_digest) = match tail {
            Some(row) => (row.try_get::<i64, _>("seq")?, row.try_get::<String, _>("digest")?),
            None => (0, GENESIS_DIGEST.to_string()),
        };

        let entry = RunLogEntry::new(prev_seq as u64 + 1, run.clone(), &prev_digest);

        sqlx::query(
            r#"
            INSERT INTO retrain_run_log
              (seq, run_id, verdict, recorded_at, record, prev_digest, digest)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.seq as i64)
        .bind(run.run_id)
        .bind(run.verdict.to_string())
        .bind(entry.recorded_at)
        .bind(serde_json::to_string(&entry.run)?)
        .bind(&entry.prev_digest)
        .bind(&entry.digest)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(entry.seq)
    }

    async fn run_log(&self) -> Result<Vec<RunLogEntry>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT seq, recorded_at, record, prev_digest, digest
            FROM retrain_run_log
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let record: String = row.try_get("record")?;
            let seq: i64 = row.try_get("seq")?;
            let recorded_at: DateTime<Utc> = row.try_get("recorded_at")?;

            entries.push(RunLogEntry {
                seq: seq as u64,
                recorded_at,
                run: serde_json::from_str(&record)?,
                prev_digest: row.try_get("prev_digest")?,
                digest: row.try_get("digest")?,
            });
        }

        Ok(entries)
    }

    async fn read_serving_state(&self) -> Result<ServingState> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT record FROM retrain_serving_state WHERE id = $1")
            .bind(SERVING_STATE_ROW)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                OrchestrationError::StoreError("serving state record is missing".into())
            })?;

        let record: String = row.try_get("record")?;
        Ok(serde_json::from_str(&record)?)
    }

    async fn compare_and_swap_serving_state(
        &self,
        expected_version: u64,
        next: &ServingState,
    ) -> Result<bool> {
        self.ensure_schema().await?;

        let result = sqlx::query(
            r#"
            UPDATE retrain_serving_state
            SET record = $1, version = $2
            WHERE id = $3 AND version = $4
            "#,
        )
        .bind(serde_json::to_string(next)?)
        .bind(next.version as i64)
        .bind(SERVING_STATE_ROW)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn publish_metric(&self, datum: MetricDatum) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            "INSERT INTO retrain_metrics (name, value, tags, recorded_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&datum.name)
        .bind(datum.value)
        .bind(serde_json::to_string(&datum.tags)?)
        .bind(datum.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn metrics(&self, name: &str) -> Result<Vec<MetricDatum>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT name, value, tags, recorded_at FROM retrain_metrics WHERE name = $1 ORDER BY id ASC",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        let mut data = Vec::with_capacity(rows.len());
        for row in rows {
            let tags: String = row.try_get("tags")?;
            data.push(MetricDatum {
                name: row.try_get("name")?,
                value: row.try_get("value")?,
                tags: serde_json::from_str(&tags)?,
                recorded_at: row.try_get("recorded_at")?,
            });
        }

        Ok(data)
    }
}

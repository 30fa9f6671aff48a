// PostgreSQL job store

use super::{settings_prefix, BackupDirectory, JobStore};
use crate::db::DbPool;
use crate::errors::StorageError;
use crate::models::{BackupFile, JobKind, JobRun, RunMetrics, ScheduledJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, name, kind, cron_expression, resource_key, enabled, options, \
                           next_fire_at, created_at, updated_at";

const RUN_COLUMNS: &str = "id, job_id, kind, trigger_source, started_at, completed_at, status, \
                           error_message, metrics";

/// PgJobStore persists jobs, runs and settings in PostgreSQL
pub struct PgJobStore {
    pool: DbPool,
    backups: BackupDirectory,
}

impl PgJobStore {
    pub fn new(pool: DbPool, backups: BackupDirectory) -> Self {
        Self { pool, backups }
    }
}

fn invalid_column(column: &str, reason: impl ToString) -> StorageError {
    StorageError::InvalidValue {
        key: column.to_string(),
        reason: reason.to_string(),
    }
}

fn job_from_row(row: &PgRow) -> Result<ScheduledJob, StorageError> {
    let kind: String = row.try_get("kind")?;
    Ok(ScheduledJob {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: kind.parse().map_err(|e| invalid_column("kind", e))?,
        cron_expression: row.try_get("cron_expression")?,
        resource_key: row.try_get("resource_key")?,
        enabled: row.try_get("enabled")?,
        options: row.try_get("options")?,
        next_fire_at: row.try_get("next_fire_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<JobRun, StorageError> {
    let kind: String = row.try_get("kind")?;
    let trigger: String = row.try_get("trigger_source")?;
    let status: String = row.try_get("status")?;
    let metrics: serde_json::Value = row.try_get("metrics")?;

    Ok(JobRun {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        kind: kind
            .parse::<JobKind>()
            .map_err(|e| invalid_column("kind", e))?,
        trigger: trigger
            .parse()
            .map_err(|e: String| invalid_column("trigger_source", e))?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        status: status
            .parse()
            .map_err(|e: String| invalid_column("status", e))?,
        error_message: row.try_get("error_message")?,
        metrics: serde_json::from_value::<RunMetrics>(metrics)
            .map_err(|e| invalid_column("metrics", e))?,
    })
}

fn to_i64(value: Option<u64>) -> Option<i64> {
    value.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self))]
    async fn list_enabled_jobs(&self) -> Result<Vec<ScheduledJob>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scheduled_jobs WHERE enabled = true ORDER BY created_at",
            JOB_COLUMNS
        ))
        .fetch_all(self.pool.pool())
        .await?;

        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        debug!(count = jobs.len(), "Loaded enabled jobs");
        Ok(jobs)
    }

    #[instrument(skip(self))]
    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scheduled_jobs ORDER BY created_at",
            JOB_COLUMNS
        ))
        .fetch_all(self.pool.pool())
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_job(&self, id: Uuid) -> Result<Option<ScheduledJob>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM scheduled_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn insert_job(&self, job: &ScheduledJob) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (
                id, name, kind, cron_expression, resource_key, enabled,
                options, next_fire_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(job.kind.as_str())
        .bind(&job.cron_expression)
        .bind(&job.resource_key)
        .bind(job.enabled)
        .bind(&job.options)
        .bind(job.next_fire_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(self.pool.pool())
        .await?;

        tracing::info!(job_id = %job.id, job_name = %job.name, "Job created");
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn update_job(&self, job: &ScheduledJob) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET name = $2, kind = $3, cron_expression = $4, resource_key = $5,
                enabled = $6, options = $7, next_fire_at = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(job.kind.as_str())
        .bind(&job.cron_expression)
        .bind(&job.resource_key)
        .bind(job.enabled)
        .bind(&job.options)
        .bind(job.next_fire_at)
        .bind(job.updated_at)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_job(&self, id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_next_fire_at(
        &self,
        id: Uuid,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE scheduled_jobs SET next_fire_at = $2 WHERE id = $1")
            .bind(id)
            .bind(next_fire_at)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    #[instrument(skip(self, run), fields(run_id = %run.id, job_id = %run.job_id))]
    async fn create_run(&self, run: &JobRun) -> Result<(), StorageError> {
        let metrics = serde_json::to_value(&run.metrics)
            .map_err(|e| invalid_column("metrics", e))?;

        sqlx::query(
            r#"
            INSERT INTO job_runs (
                id, job_id, kind, trigger_source, started_at, completed_at,
                status, error_message, metrics
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(run.job_id)
        .bind(run.kind.as_str())
        .bind(run.trigger.to_string())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.status.to_string())
        .bind(&run.error_message)
        .bind(metrics)
        .execute(self.pool.pool())
        .await?;

        Ok(())
    }

    #[instrument(skip(self, run), fields(run_id = %run.id, status = %run.status))]
    async fn finalize_run(&self, run: &JobRun) -> Result<(), StorageError> {
        let metrics = serde_json::to_value(&run.metrics)
            .map_err(|e| invalid_column("metrics", e))?;

        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2, completed_at = $3, error_message = $4, metrics = $5,
                duration_ms = $6, bytes_moved = $7, files_affected = $8
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run.id)
        .bind(run.status.to_string())
        .bind(run.completed_at)
        .bind(&run.error_message)
        .bind(metrics)
        .bind(to_i64(Some(run.metrics.duration_ms)))
        .bind(to_i64(run.metrics.bytes_moved))
        .bind(to_i64(run.metrics.files_affected))
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            warn!("Run was missing or already finalized");
            return Err(StorageError::InvalidValue {
                key: format!("run {}", run.id),
                reason: "run is missing or already finalized".to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_interrupted_runs(&self, message: &str) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = 'failed', completed_at = NOW(), error_message = $1
            WHERE status = 'running'
            "#,
        )
        .bind(message)
        .execute(self.pool.pool())
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn list_runs_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM job_runs WHERE started_at >= $1 AND started_at < $2 \
             ORDER BY started_at",
            RUN_COLUMNS
        ))
        .bind(from)
        .bind(to)
        .fetch_all(self.pool.pool())
        .await?;

        rows.iter().map(run_from_row).collect()
    }

    async fn get_settings(&self, prefix: &str) -> Result<HashMap<String, String>, StorageError> {
        let pattern = format!("{}%", settings_prefix(prefix));
        let rows = sqlx::query("SELECT key, value FROM settings WHERE key LIKE $1")
            .bind(pattern)
            .fetch_all(self.pool.pool())
            .await?;

        let mut values = HashMap::with_capacity(rows.len());
        for row in rows {
            values.insert(row.try_get("key")?, row.try_get("value")?);
        }
        Ok(values)
    }

    #[instrument(skip(self, values), fields(count = values.len()))]
    async fn put_settings(&self, values: &[(String, String)]) -> Result<(), StorageError> {
        let mut tx = self.pool.pool().begin().await?;
        for (key, value) in values {
            sqlx::query(
                r#"
                INSERT INTO settings (key, value, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_backup_files(&self, database_id: &str) -> Result<Vec<BackupFile>, StorageError> {
        self.backups.list(database_id).await
    }

    async fn list_databases(&self) -> Result<Vec<String>, StorageError> {
        self.backups.list_databases().await
    }
}

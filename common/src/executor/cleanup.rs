// Retention cleanup executor
//
// Everything that can fail before a file is touched (policy load, listings)
// fails the run. Once deleting starts, per-file errors are collected and the
// run ends `partial` instead.

use super::{ExecutionReport, JobExecutor};
use crate::errors::ExecutionError;
use crate::models::{BackupFile, JobKind, RunMetrics, ScheduledJob};
use crate::policy::RetentionPolicy;
use crate::retention;
use crate::store::{load_policy, JobStore};
use crate::telemetry;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct CleanupExecutor {
    store: Arc<dyn JobStore>,
}

impl CleanupExecutor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Databases in scope: the job's own, or every database on disk
    async fn databases(&self, job: &ScheduledJob) -> Result<Vec<String>, ExecutionError> {
        match job.resource_key.as_deref() {
            Some(database_id) => Ok(vec![database_id.to_string()]),
            None => Ok(self.store.list_databases().await?),
        }
    }
}

#[async_trait]
impl JobExecutor for CleanupExecutor {
    fn kind(&self) -> JobKind {
        JobKind::Cleanup
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn run(&self, job: &ScheduledJob) -> Result<ExecutionReport, ExecutionError> {
        let policy: RetentionPolicy = load_policy(self.store.as_ref()).await?;
        if !policy.enabled {
            info!("Retention policy disabled, nothing to clean");
            return Ok(ExecutionReport::success(RunMetrics {
                files_affected: Some(0),
                note: Some("retention policy disabled".to_string()),
                ..Default::default()
            }));
        }

        let mut listing: Vec<BackupFile> = Vec::new();
        for database_id in self.databases(job).await? {
            listing.extend(self.store.list_backup_files(&database_id).await?);
        }
        let plan = retention::plan(&listing, &policy);

        let mut deleted = 0u64;
        let mut bytes_freed = 0u64;
        let mut file_errors = Vec::new();
        for file in &plan.delete {
            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => {
                    deleted += 1;
                    bytes_freed += file.size_bytes;
                }
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "Failed to delete backup file");
                    file_errors.push(format!("{}: {}", file.path.display(), e));
                }
            }
        }
        telemetry::record_files_deleted(deleted);

        info!(
            planned = plan.delete.len(),
            deleted,
            bytes_freed,
            errors = file_errors.len(),
            "Retention cleanup finished"
        );

        let error_count = file_errors.len();
        let metrics = RunMetrics {
            bytes_moved: Some(bytes_freed),
            files_affected: Some(deleted),
            file_errors,
            note: Some(format!(
                "kept {} file(s), deleted {} of {}",
                plan.keep.len(),
                deleted,
                plan.delete.len()
            )),
            ..Default::default()
        };

        if error_count == 0 {
            Ok(ExecutionReport::success(metrics))
        } else {
            Ok(ExecutionReport::partial(
                metrics,
                format!("{} file(s) could not be deleted", error_count),
            ))
        }
    }
}

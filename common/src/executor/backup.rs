// Backup job executor

use super::{invalid_options, ExecutionReport, JobExecutor};
use crate::bandwidth::SyncTrigger;
use crate::drivers::{BackupRequest, DatabaseDriver};
use crate::errors::ExecutionError;
use crate::models::{JobKind, RunMetrics, ScheduledJob};
use crate::store::BackupDirectory;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};

/// BackupExecutor writes one backup file per run into the backup directory
pub struct BackupExecutor {
    driver: Arc<dyn DatabaseDriver>,
    backups: BackupDirectory,
    sync_trigger: Arc<SyncTrigger>,
}

impl BackupExecutor {
    pub fn new(
        driver: Arc<dyn DatabaseDriver>,
        backups: BackupDirectory,
        sync_trigger: Arc<SyncTrigger>,
    ) -> Self {
        Self {
            driver,
            backups,
            sync_trigger,
        }
    }
}

#[async_trait]
impl JobExecutor for BackupExecutor {
    fn kind(&self) -> JobKind {
        JobKind::Backup
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, database_id = ?job.resource_key))]
    async fn run(&self, job: &ScheduledJob) -> Result<ExecutionReport, ExecutionError> {
        let database_id = job.require_resource_key()?;
        let options = job.backup_options().map_err(|e| invalid_options(job, e))?;

        let destination = self
            .backups
            .backup_path(database_id, options.backup_type, Utc::now())?;
        let request = BackupRequest {
            database_id: database_id.to_string(),
            options,
            destination,
        };

        let outcome = self.driver.run_backup(&request).await?;
        info!(
            bytes_written = outcome.bytes_written,
            backup_type = %request.options.backup_type,
            "Backup completed"
        );

        self.sync_trigger.on_backup_completed(Utc::now()).await;

        let file_name = request
            .destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        Ok(ExecutionReport::success(RunMetrics {
            bytes_moved: Some(outcome.bytes_written),
            files_affected: Some(1),
            note: file_name,
            ..Default::default()
        }))
    }
}

// Maintenance job executor

use super::{invalid_options, ExecutionReport, JobExecutor};
use crate::bandwidth::SyncTrigger;
use crate::drivers::DatabaseDriver;
use crate::errors::ExecutionError;
use crate::models::{JobKind, RunMetrics, ScheduledJob};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};

pub struct MaintenanceExecutor {
    driver: Arc<dyn DatabaseDriver>,
    sync_trigger: Arc<SyncTrigger>,
}

impl MaintenanceExecutor {
    pub fn new(driver: Arc<dyn DatabaseDriver>, sync_trigger: Arc<SyncTrigger>) -> Self {
        Self {
            driver,
            sync_trigger,
        }
    }
}

#[async_trait]
impl JobExecutor for MaintenanceExecutor {
    fn kind(&self) -> JobKind {
        JobKind::Maintenance
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, database_id = ?job.resource_key))]
    async fn run(&self, job: &ScheduledJob) -> Result<ExecutionReport, ExecutionError> {
        let database_id = job.require_resource_key()?;
        let options = job
            .maintenance_options()
            .map_err(|e| invalid_options(job, e))?;

        let outcome = self.driver.run_maintenance(database_id, &options).await?;
        info!(task = %options.task, "Maintenance completed");

        self.sync_trigger.on_backup_completed(Utc::now()).await;

        Ok(ExecutionReport::success(RunMetrics {
            note: Some(match outcome.summary {
                Some(summary) => format!("{}: {}", options.task, summary),
                None => options.task.to_string(),
            }),
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{MaintenanceOutcome, MockDatabaseDriver};
    use crate::models::{MaintenanceTask, NewJob, RunStatus};
    use crate::scheduler::dispatch::dispatch_channel;
    use crate::store::{BackupDirectory, MemoryJobStore};

    fn sync_trigger() -> Arc<SyncTrigger> {
        let store = Arc::new(MemoryJobStore::new(BackupDirectory::new("/nonexistent")));
        let (tx, _rx) = dispatch_channel();
        Arc::new(SyncTrigger::new(store, tx, chrono_tz::UTC))
    }

    fn job() -> ScheduledJob {
        ScheduledJob::from_new(NewJob {
            name: "weekly checkdb".to_string(),
            kind: JobKind::Maintenance,
            cron_expression: "0 1 * * 0".to_string(),
            resource_key: Some("hr".to_string()),
            enabled: true,
            options: serde_json::json!({"task": "integrity_check", "physical_only": true}),
        })
    }

    #[tokio::test]
    async fn test_runs_task_against_resource() {
        let mut driver = MockDatabaseDriver::new();
        driver
            .expect_run_maintenance()
            .withf(|db, options| {
                db == "hr"
                    && options.task == MaintenanceTask::IntegrityCheck
                    && options.physical_only
            })
            .times(1)
            .returning(|_, _| {
                Ok(MaintenanceOutcome {
                    summary: Some("CHECKDB found 0 errors".to_string()),
                })
            });

        let executor = MaintenanceExecutor::new(Arc::new(driver), sync_trigger());
        let report = executor.run(&job()).await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(
            report.metrics.note.as_deref(),
            Some("integrity_check: CHECKDB found 0 errors")
        );
    }

    #[tokio::test]
    async fn test_missing_resource_key_is_invalid() {
        let driver = MockDatabaseDriver::new();
        let executor = MaintenanceExecutor::new(Arc::new(driver), sync_trigger());
        let mut job = job();
        job.resource_key = None;
        assert!(matches!(
            executor.run(&job).await,
            Err(ExecutionError::InvalidJobDefinition(_))
        ));
    }
}

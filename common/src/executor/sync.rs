// Remote sync executor, throttled by the bandwidth policy

use super::{ExecutionReport, JobExecutor};
use crate::bandwidth::effective_limit;
use crate::drivers::SyncDriver;
use crate::errors::ExecutionError;
use crate::models::{JobKind, RunMetrics, ScheduledJob};
use crate::policy::BandwidthPolicy;
use crate::store::{load_policy, JobStore};
use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{info, instrument};

pub struct SyncExecutor {
    driver: Arc<dyn SyncDriver>,
    store: Arc<dyn JobStore>,
    timezone: Tz,
}

impl SyncExecutor {
    pub fn new(driver: Arc<dyn SyncDriver>, store: Arc<dyn JobStore>, timezone: Tz) -> Self {
        Self {
            driver,
            store,
            timezone,
        }
    }
}

#[async_trait]
impl JobExecutor for SyncExecutor {
    fn kind(&self) -> JobKind {
        JobKind::Sync
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn run(&self, job: &ScheduledJob) -> Result<ExecutionReport, ExecutionError> {
        let policy: BandwidthPolicy = load_policy(self.store.as_ref()).await?;
        let limit = effective_limit(&Utc::now().with_timezone(&self.timezone), &policy);

        if limit.is_paused() {
            info!("Bandwidth policy pauses transfers, skipping sync");
            return Ok(ExecutionReport::success(RunMetrics {
                bytes_moved: Some(0),
                note: Some("transfer paused by bandwidth policy (0 KB/s)".to_string()),
                ..Default::default()
            }));
        }

        let outcome = self.driver.sync(limit).await?;
        info!(
            bytes_transferred = outcome.bytes_transferred,
            limit = %limit,
            "Sync completed"
        );

        Ok(ExecutionReport::success(RunMetrics {
            bytes_moved: Some(outcome.bytes_transferred),
            bytes_deduplicated: Some(outcome.bytes_deduplicated),
            files_affected: Some(outcome.files),
            note: Some(format!("rate limit: {}", limit)),
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::BandwidthLimit;
    use crate::drivers::{MockSyncDriver, SyncOutcome};
    use crate::models::{NewJob, RunStatus};
    use crate::store::{save_policy, BackupDirectory, MemoryJobStore};
    use chrono::NaiveTime;

    fn job() -> ScheduledJob {
        ScheduledJob::from_new(NewJob {
            name: "offsite".to_string(),
            kind: JobKind::Sync,
            cron_expression: "0 3 * * *".to_string(),
            resource_key: None,
            enabled: true,
            options: serde_json::Value::Null,
        })
    }

    async fn store_with(policy: BandwidthPolicy) -> Arc<MemoryJobStore> {
        let store = Arc::new(MemoryJobStore::new(BackupDirectory::new("/nonexistent")));
        save_policy(store.as_ref(), &policy).await.unwrap();
        store
    }

    /// A policy whose peak window covers the whole day, every day
    fn all_day(peak_limit_kbs: u64) -> BandwidthPolicy {
        BandwidthPolicy {
            enabled: true,
            peak_limit_kbs,
            offpeak_limit_kbs: peak_limit_kbs,
            peak_start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            peak_end: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            weekend_unlimited: false,
        }
    }

    #[tokio::test]
    async fn test_disabled_policy_syncs_unlimited() {
        let mut driver = MockSyncDriver::new();
        driver
            .expect_sync()
            .withf(|limit| *limit == BandwidthLimit::Unlimited)
            .times(1)
            .returning(|_| {
                Ok(SyncOutcome {
                    bytes_transferred: 10,
                    bytes_deduplicated: 90,
                    files: 3,
                })
            });

        let store = store_with(BandwidthPolicy::default()).await;
        let executor = SyncExecutor::new(Arc::new(driver), store, chrono_tz::UTC);
        let report = executor.run(&job()).await.unwrap();
        assert_eq!(report.metrics.bytes_moved, Some(10));
        assert_eq!(report.metrics.bytes_deduplicated, Some(90));
        assert_eq!(report.metrics.files_affected, Some(3));
    }

    #[tokio::test]
    async fn test_limit_is_passed_to_driver() {
        let mut driver = MockSyncDriver::new();
        driver
            .expect_sync()
            .withf(|limit| *limit == BandwidthLimit::Limited(256))
            .times(1)
            .returning(|_| Ok(SyncOutcome::default()));

        let executor = SyncExecutor::new(
            Arc::new(driver),
            store_with(all_day(256)).await,
            chrono_tz::UTC,
        );
        assert!(executor.run(&job()).await.is_ok());
    }

    #[tokio::test]
    async fn test_paused_policy_skips_transfer() {
        let mut driver = MockSyncDriver::new();
        driver.expect_sync().times(0);

        let executor = SyncExecutor::new(
            Arc::new(driver),
            store_with(all_day(0)).await,
            chrono_tz::UTC,
        );
        let report = executor.run(&job()).await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.metrics.bytes_moved, Some(0));
        assert!(report.metrics.note.unwrap().contains("paused"));
    }
}

// In-process job store used by tests and by hosts without Postgres.

use super::{settings_prefix, BackupDirectory, JobStore};
use crate::errors::StorageError;
use crate::models::{BackupFile, JobRun, RunStatus, ScheduledJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, ScheduledJob>,
    runs: Vec<JobRun>,
    settings: HashMap<String, String>,
}

/// MemoryJobStore keeps jobs, runs and settings in memory. Backup files are
/// still read from disk.
pub struct MemoryJobStore {
    state: RwLock<State>,
    backups: BackupDirectory,
}

impl MemoryJobStore {
    pub fn new(backups: BackupDirectory) -> Self {
        Self {
            state: RwLock::new(State::default()),
            backups,
        }
    }

    /// Every recorded run, in creation order
    pub async fn runs(&self) -> Vec<JobRun> {
        self.state.read().await.runs.clone()
    }

    /// Runs of a single job, in creation order
    pub async fn runs_for_job(&self, job_id: Uuid) -> Vec<JobRun> {
        self.state
            .read()
            .await
            .runs
            .iter()
            .filter(|run| run.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list_enabled_jobs(&self) -> Result<Vec<ScheduledJob>, StorageError> {
        let state = self.state.read().await;
        let mut jobs: Vec<ScheduledJob> =
            state.jobs.values().filter(|job| job.enabled).cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, StorageError> {
        let state = self.state.read().await;
        let mut jobs: Vec<ScheduledJob> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ScheduledJob>, StorageError> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn insert_job(&self, job: &ScheduledJob) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StorageError::DatabaseError(format!(
                "job {} already exists",
                job.id
            )));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &ScheduledJob) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("job {}", job.id))),
        }
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, StorageError> {
        Ok(self.state.write().await.jobs.remove(&id).is_some())
    }

    async fn set_next_fire_at(
        &self,
        id: Uuid,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        // The job may have been deleted while the write was in flight
        if let Some(job) = self.state.write().await.jobs.get_mut(&id) {
            job.next_fire_at = next_fire_at;
        }
        Ok(())
    }

    async fn create_run(&self, run: &JobRun) -> Result<(), StorageError> {
        self.state.write().await.runs.push(run.clone());
        Ok(())
    }

    async fn finalize_run(&self, run: &JobRun) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let existing = state
            .runs
            .iter_mut()
            .find(|existing| existing.id == run.id)
            .ok_or_else(|| StorageError::NotFound(format!("run {}", run.id)))?;

        if existing.status.is_terminal() {
            return Err(StorageError::InvalidValue {
                key: format!("run {}", run.id),
                reason: format!("already finalized as {}", existing.status),
            });
        }
        *existing = run.clone();
        Ok(())
    }

    async fn fail_interrupted_runs(&self, message: &str) -> Result<u64, StorageError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut closed = 0;
        for run in state.runs.iter_mut().filter(|run| run.status == RunStatus::Running) {
            run.status = RunStatus::Failed;
            run.completed_at = Some(now);
            run.error_message = Some(message.to_string());
            closed += 1;
        }
        Ok(closed)
    }

    async fn list_runs_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .iter()
            .filter(|run| run.started_at >= from && run.started_at < to)
            .cloned()
            .collect())
    }

    async fn get_settings(&self, prefix: &str) -> Result<HashMap<String, String>, StorageError> {
        let prefix = settings_prefix(prefix);
        let state = self.state.read().await;
        Ok(state
            .settings
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn put_settings(&self, values: &[(String, String)]) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        for (key, value) in values {
            state.settings.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn list_backup_files(&self, database_id: &str) -> Result<Vec<BackupFile>, StorageError> {
        self.backups.list(database_id).await
    }

    async fn list_databases(&self) -> Result<Vec<String>, StorageError> {
        self.backups.list_databases().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobKind, NewJob, RunMetrics, TriggerSource};
    use crate::policy::RetentionPolicy;
    use crate::store::{load_policy, save_policy};

    fn store() -> MemoryJobStore {
        MemoryJobStore::new(BackupDirectory::new("/nonexistent/backups"))
    }

    fn job(enabled: bool) -> ScheduledJob {
        ScheduledJob::from_new(NewJob {
            name: "sync".to_string(),
            kind: JobKind::Sync,
            cron_expression: "0 3 * * *".to_string(),
            resource_key: None,
            enabled,
            options: serde_json::Value::Null,
        })
    }

    #[tokio::test]
    async fn test_list_enabled_jobs_filters_disabled() {
        let store = store();
        let enabled = job(true);
        store.insert_job(&enabled).await.unwrap();
        store.insert_job(&job(false)).await.unwrap();

        let jobs = store.list_enabled_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, enabled.id);
        assert_eq!(store.list_jobs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_finalize_run_only_once() {
        let store = store();
        let mut run = JobRun::start(Uuid::new_v4(), JobKind::Sync, TriggerSource::Manual);
        store.create_run(&run).await.unwrap();

        run.finish(RunStatus::Success, RunMetrics::default(), None);
        store.finalize_run(&run).await.unwrap();
        assert!(store.finalize_run(&run).await.is_err());
        assert_eq!(store.runs().await[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_fail_interrupted_runs_leaves_finished_runs_alone() {
        let store = store();
        let mut done = JobRun::start(Uuid::new_v4(), JobKind::Sync, TriggerSource::Manual);
        store.create_run(&done).await.unwrap();
        done.finish(RunStatus::Success, RunMetrics::default(), None);
        store.finalize_run(&done).await.unwrap();
        let stale = JobRun::start(Uuid::new_v4(), JobKind::Backup, TriggerSource::Scheduled);
        store.create_run(&stale).await.unwrap();

        assert_eq!(store.fail_interrupted_runs("gone").await.unwrap(), 1);
        assert_eq!(store.fail_interrupted_runs("gone").await.unwrap(), 0);

        let runs = store.runs().await;
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].error_message, None);
        assert_eq!(runs[1].status, RunStatus::Failed);
        assert_eq!(runs[1].error_message.as_deref(), Some("gone"));
        assert!(runs[1].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_policy_round_trip_through_settings() {
        let store = store();
        let policy = RetentionPolicy {
            enabled: true,
            keep_full_count: 5,
            ..Default::default()
        };
        save_policy(&store, &policy).await.unwrap();
        let loaded: RetentionPolicy = load_policy(&store).await.unwrap();
        assert_eq!(loaded, policy);
    }

    #[tokio::test]
    async fn test_missing_settings_fall_back_to_defaults() {
        let loaded: RetentionPolicy = load_policy(&store()).await.unwrap();
        assert_eq!(loaded, RetentionPolicy::default());
    }

    #[tokio::test]
    async fn test_set_next_fire_at_on_deleted_job_is_ignored() {
        let store = store();
        assert!(store
            .set_next_fire_at(Uuid::new_v4(), Some(Utc::now()))
            .await
            .is_ok());
    }
}

// Job store: persisted jobs, run history, policy settings and the on-disk
// backup listing the retention planner works from.

pub mod backup_dir;
pub mod memory;
pub mod postgres;

pub use backup_dir::BackupDirectory;
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use crate::errors::StorageError;
use crate::models::{BackupFile, JobRun, ScheduledJob};
use crate::policy::SettingsRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// JobStore is everything the engine needs from persistence
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Every enabled job; used by the bulk reload at startup
    async fn list_enabled_jobs(&self) -> Result<Vec<ScheduledJob>, StorageError>;

    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, StorageError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<ScheduledJob>, StorageError>;

    async fn insert_job(&self, job: &ScheduledJob) -> Result<(), StorageError>;

    async fn update_job(&self, job: &ScheduledJob) -> Result<(), StorageError>;

    /// Returns false when no such job existed
    async fn delete_job(&self, id: Uuid) -> Result<bool, StorageError>;

    async fn set_next_fire_at(
        &self,
        id: Uuid,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;

    /// Record a run in `running` state
    async fn create_run(&self, run: &JobRun) -> Result<(), StorageError>;

    /// Move a running run to its terminal state. Fails if the run was
    /// already finalized.
    async fn finalize_run(&self, run: &JobRun) -> Result<(), StorageError>;

    /// Fail every run still marked `running`. Called before any run of this
    /// process starts, so those rows belong to a process that is gone.
    /// Returns how many runs were closed.
    async fn fail_interrupted_runs(&self, message: &str) -> Result<u64, StorageError>;

    /// Runs started in `[from, to)`
    async fn list_runs_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, StorageError>;

    /// All settings whose key starts with `prefix.`
    async fn get_settings(&self, prefix: &str) -> Result<HashMap<String, String>, StorageError>;

    async fn put_settings(&self, values: &[(String, String)]) -> Result<(), StorageError>;

    /// Backup files currently on disk for a database
    async fn list_backup_files(&self, database_id: &str) -> Result<Vec<BackupFile>, StorageError>;

    /// Databases that have a backup directory
    async fn list_databases(&self) -> Result<Vec<String>, StorageError>;
}

/// Load a policy fresh from the store
pub async fn load_policy<P: SettingsRecord>(store: &dyn JobStore) -> Result<P, StorageError> {
    let values = store.get_settings(P::PREFIX).await?;
    P::from_settings(&values)
}

/// Persist a policy
pub async fn save_policy<P: SettingsRecord>(
    store: &dyn JobStore,
    policy: &P,
) -> Result<(), StorageError> {
    store.put_settings(&policy.to_settings()).await
}

pub(crate) fn settings_prefix(prefix: &str) -> String {
    format!("{}.", prefix)
}

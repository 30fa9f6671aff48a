// Error types shared across the orchestrator
// Failures inside a run are data (JobRun rows); only registration-time
// problems and store outages surface as errors to callers.

use thiserror::Error;
use uuid::Uuid;

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("No next execution time available for '{expression}'")]
    NoNextExecution { expression: String },

    /// A stored schedule that used to be valid can no longer be evaluated.
    /// The job stays unarmed until it is updated.
    #[error("Job {job_id} is not scheduled: {reason}")]
    Unschedulable { job_id: Uuid, reason: String },
}

/// Job execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("No executor registered for job kind '{0}'")]
    NoExecutor(String),

    #[error("Execution timeout after {0} seconds")]
    Timeout(u64),

    #[error("Database driver failed: {0}")]
    DatabaseDriverFailed(String),

    #[error("Sync driver failed: {0}")]
    SyncDriverFailed(String),

    #[error("Failed to spawn external command '{command}': {reason}")]
    CommandSpawnFailed { command: String, reason: String },

    #[error("Storage operation failed: {0}")]
    StorageFailed(String),

    #[error("Invalid job definition: {0}")]
    InvalidJobDefinition(String),

    #[error("Executor panicked: {0}")]
    Panicked(String),
}

/// Validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Connection pool lifecycle errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database unreachable: {0}")]
    Unreachable(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Job store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Filesystem error: {0}")]
    FileSystemError(String),

    #[error("Invalid stored value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Errors returned by the engine's exposed operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Scheduler engine is already running")]
    AlreadyStarted,
}

impl From<ScheduleError> for EngineError {
    fn from(err: ScheduleError) -> Self {
        EngineError::Validation(ValidationError::Schedule(err))
    }
}

const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound("row".to_string()),
            sqlx::Error::Database(db_err)
                if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                StorageError::Duplicate(db_err.message().to_string())
            }
            other => StorageError::DatabaseError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::FileSystemError(err.to_string())
    }
}

impl From<StorageError> for ExecutionError {
    fn from(err: StorageError) -> Self {
        ExecutionError::StorageFailed(err.to_string())
    }
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::InvalidJson(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "expected 5 fields".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    #[test]
    fn test_storage_error_reaches_run_history_as_text() {
        let err: ExecutionError = StorageError::Duplicate("run 42".to_string()).into();
        assert_eq!(
            err.to_string(),
            "Storage operation failed: Duplicate record: run 42"
        );
    }

    #[test]
    fn test_schedule_error_becomes_validation_error() {
        let err: EngineError = ScheduleError::NoNextExecution {
            expression: "0 0 30 2 *".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::Schedule(_))
        ));
    }

    #[test]
    fn test_missing_row_maps_to_not_found() {
        let err: StorageError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}

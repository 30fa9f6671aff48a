// Job executors: one strategy per job kind

pub mod backup;
pub mod cleanup;
pub mod maintenance;
pub mod summary;
pub mod sync;

pub use backup::BackupExecutor;
pub use cleanup::CleanupExecutor;
pub use maintenance::MaintenanceExecutor;
pub use summary::SummaryExecutor;
pub use sync::SyncExecutor;

use crate::errors::{ExecutionError, ValidationError};
use crate::models::{JobKind, RunMetrics, RunStatus, ScheduledJob};
use async_trait::async_trait;

/// What an executor reports back for a run that did not error out
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub status: RunStatus,
    pub metrics: RunMetrics,
    pub error_message: Option<String>,
}

impl ExecutionReport {
    pub fn success(metrics: RunMetrics) -> Self {
        Self {
            status: RunStatus::Success,
            metrics,
            error_message: None,
        }
    }

    pub fn partial(metrics: RunMetrics, message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Partial,
            metrics,
            error_message: Some(message.into()),
        }
    }
}

/// JobExecutor runs one kind of job
#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Run the job once. Duration is measured by the caller.
    async fn run(&self, job: &ScheduledJob) -> Result<ExecutionReport, ExecutionError>;
}

fn invalid_options(job: &ScheduledJob, err: ValidationError) -> ExecutionError {
    ExecutionError::InvalidJobDefinition(format!("job {} has invalid options: {}", job.id, err))
}

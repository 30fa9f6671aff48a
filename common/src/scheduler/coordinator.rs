// Execution coordinator
//
// Gates every run on an at-most-one-running-per-job set, routes the job to
// the executor for its kind and turns whatever happens into a terminal
// JobRun. Nothing above this layer sees an executor error or panic.

use crate::errors::ExecutionError;
use crate::executor::{ExecutionReport, JobExecutor};
use crate::models::{
    ExecutionOutcome, JobKind, JobRun, RunMetrics, RunStatus, ScheduledJob, TriggerSource,
};
use crate::notify::{spawn_failure_notice, FailureNotice, Notifier};
use crate::store::JobStore;
use crate::telemetry;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Removes the job from the running set when dropped
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<Uuid>>,
    job_id: Uuid,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        running.remove(&self.job_id);
        telemetry::update_running_jobs(running.len());
    }
}

pub struct ExecutionCoordinator {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    executors: RwLock<HashMap<JobKind, Arc<dyn JobExecutor>>>,
    running: Mutex<HashSet<Uuid>>,
}

impl ExecutionCoordinator {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            executors: RwLock::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Route jobs of `executor.kind()` to `executor`, replacing any previous one
    pub fn register_executor(&self, executor: Arc<dyn JobExecutor>) {
        let mut executors = self
            .executors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        executors.insert(executor.kind(), executor);
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.lock_running().contains(&job_id)
    }

    pub fn running_count(&self) -> usize {
        self.lock_running().len()
    }

    /// Execute `job` once unless a run of it is already in progress.
    ///
    /// A skipped fire creates no JobRun. Otherwise the returned run is always
    /// terminal, and was finalized in the store exactly once if it could be
    /// recorded at all.
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind, trigger = %trigger))]
    pub async fn execute(&self, job: &ScheduledJob, trigger: TriggerSource) -> ExecutionOutcome {
        let Some(_guard) = self.try_claim(job.id) else {
            info!("Job is already running, skipping this fire");
            telemetry::record_run_skipped(&job.id, job.kind);
            return ExecutionOutcome::Skipped {
                job_id: job.id,
                reason: "a run of this job is already in progress".to_string(),
            };
        };

        let mut run = JobRun::start(job.id, job.kind, trigger);
        if let Err(e) = self.store.create_run(&run).await {
            // Without a history row the job does not run at all
            error!(run_id = %run.id, error = %e, "Failed to record run start");
            run.finish(
                RunStatus::Failed,
                RunMetrics::default(),
                Some(format!("could not record run: {}", e)),
            );
            self.report(job, &run);
            return ExecutionOutcome::Completed(run);
        }

        let started = Instant::now();
        let result = self.run_executor(job).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(ExecutionReport {
                status,
                mut metrics,
                error_message,
            }) => {
                metrics.duration_ms = duration_ms;
                run.finish(status, metrics, error_message);
            }
            Err(e) => {
                run.finish(
                    RunStatus::Failed,
                    RunMetrics {
                        duration_ms,
                        ..Default::default()
                    },
                    Some(e.to_string()),
                );
            }
        }

        if let Err(e) = self.store.finalize_run(&run).await {
            error!(run_id = %run.id, error = %e, "Failed to finalize run");
        }
        self.report(job, &run);
        ExecutionOutcome::Completed(run)
    }

    async fn run_executor(&self, job: &ScheduledJob) -> Result<ExecutionReport, ExecutionError> {
        let executor = self
            .executors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&job.kind)
            .cloned()
            .ok_or_else(|| ExecutionError::NoExecutor(job.kind.to_string()))?;

        match AssertUnwindSafe(executor.run(job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ExecutionError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    /// Log, count and (for failures) notify a terminal run
    fn report(&self, job: &ScheduledJob, run: &JobRun) {
        telemetry::record_run_finished(
            &job.id,
            job.kind,
            run.status,
            run.metrics.duration_ms as f64 / 1000.0,
            run.metrics.bytes_moved,
        );

        match run.status {
            RunStatus::Failed => {
                warn!(
                    run_id = %run.id,
                    error = run.error_message.as_deref().unwrap_or_default(),
                    "Run failed"
                );
                spawn_failure_notice(
                    self.notifier.clone(),
                    FailureNotice::from_run(run, &job.name, job.resource_key.as_deref()),
                );
            }
            status => info!(
                run_id = %run.id,
                status = %status,
                duration_ms = run.metrics.duration_ms,
                "Run finished"
            ),
        }
    }

    fn try_claim(&self, job_id: Uuid) -> Option<RunningGuard<'_>> {
        let mut running = self.lock_running();
        if !running.insert(job_id) {
            return None;
        }
        telemetry::update_running_jobs(running.len());
        Some(RunningGuard {
            running: &self.running,
            job_id,
        })
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

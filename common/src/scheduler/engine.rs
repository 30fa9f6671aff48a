// Scheduler engine: wires the registry, the trigger loop, the coordinator and
// the sync trigger together and exposes the job/policy operations.

use crate::bandwidth::SyncTrigger;
use crate::config::Settings;
use crate::drivers::{DatabaseDriver, SyncDriver};
use crate::errors::{EngineError, ScheduleError, StorageError};
use crate::executor::{
    BackupExecutor, CleanupExecutor, JobExecutor, MaintenanceExecutor, SummaryExecutor,
    SyncExecutor,
};
use crate::models::{ExecutionOutcome, JobKind, JobUpdate, NewJob, ScheduledJob, TriggerSource};
use crate::notify::Notifier;
use crate::policy::{BandwidthPolicy, RetentionPolicy, SyncSettings};
use crate::retention::{self, RetentionPreview};
use crate::schedule::parse_timezone;
use crate::scheduler::coordinator::ExecutionCoordinator;
use crate::scheduler::dispatch::{
    dispatch_channel, DispatchReceiver, DispatchRequest, DispatchTarget,
};
use crate::scheduler::registry::{ScheduleRegistry, ScheduleStatus, ScheduledEntry};
use crate::stagger::{self, StaggerWindow};
use crate::store::{load_policy, save_policy, BackupDirectory, JobStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the scheduler engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Time zone cron expressions and policies are evaluated in
    pub timezone: Tz,
    /// How long `stop` waits for in-flight runs before aborting them
    pub shutdown_grace: Duration,
    pub backups: BackupDirectory,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ScheduleError> {
        Ok(Self {
            timezone: parse_timezone(&settings.scheduler.timezone)?,
            shutdown_grace: Duration::from_secs(settings.scheduler.shutdown_grace_seconds),
            backups: BackupDirectory::new(&settings.backup.root_dir),
        })
    }
}

/// External drivers the executors run against
#[derive(Clone)]
pub struct EngineDrivers {
    pub database: Arc<dyn DatabaseDriver>,
    pub sync: Arc<dyn SyncDriver>,
}

/// Scheduler trait for the engine lifecycle
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Reload jobs from the store and run the trigger loop until stopped
    async fn start(&self) -> Result<(), EngineError>;

    /// Stop the trigger loop; `start` returns once in-flight runs drained
    async fn stop(&self) -> Result<(), EngineError>;
}

/// Main scheduler engine implementation
pub struct SchedulerEngine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<ScheduleRegistry>,
    coordinator: Arc<ExecutionCoordinator>,
    sync_trigger: Arc<SyncTrigger>,
    dispatch_rx: Mutex<Option<DispatchReceiver>>,
    shutdown_tx: watch::Sender<bool>,
    /// Serializes job mutations so the registry and the store agree
    mutations: Mutex<()>,
}

/// Message recorded on runs left `running` by a previous process
const INTERRUPTED_RUN_MESSAGE: &str = "interrupted by shutdown";

impl SchedulerEngine {
    /// Build an engine with the standard executor for every job kind.
    /// Nothing is armed until `start` (or `reload_from_store`) runs.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        drivers: EngineDrivers,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (dispatch_tx, dispatch_rx) = dispatch_channel();
        let sync_trigger = Arc::new(SyncTrigger::new(
            store.clone(),
            dispatch_tx.clone(),
            config.timezone,
        ));
        let registry = Arc::new(ScheduleRegistry::new(config.timezone, dispatch_tx));
        let coordinator = Arc::new(ExecutionCoordinator::new(store.clone(), notifier.clone()));

        let executors: Vec<Arc<dyn JobExecutor>> = vec![
            Arc::new(BackupExecutor::new(
                drivers.database.clone(),
                config.backups.clone(),
                sync_trigger.clone(),
            )),
            Arc::new(MaintenanceExecutor::new(
                drivers.database,
                sync_trigger.clone(),
            )),
            Arc::new(SyncExecutor::new(drivers.sync, store.clone(), config.timezone)),
            Arc::new(CleanupExecutor::new(store.clone())),
            Arc::new(SummaryExecutor::new(store.clone(), notifier, config.timezone)),
        ];
        for executor in executors {
            coordinator.register_executor(executor);
        }

        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        Self {
            config,
            store,
            registry,
            coordinator,
            sync_trigger,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            shutdown_tx,
            mutations: Mutex::new(()),
        }
    }

    /// Replace the executor for `executor.kind()`
    pub fn register_executor(&self, executor: Arc<dyn JobExecutor>) {
        self.coordinator.register_executor(executor);
    }

    pub fn timezone(&self) -> Tz {
        self.config.timezone
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Validate, arm and persist a new job
    #[instrument(skip(self, new), fields(name = %new.name, kind = %new.kind))]
    pub async fn add_job(&self, new: NewJob) -> Result<ScheduledJob, EngineError> {
        let mut job = ScheduledJob::from_new(new);
        job.validate()?;

        let _mutating = self.mutations.lock().await;
        self.arm(&mut job).await?;
        if let Err(e) = self.store.insert_job(&job).await {
            self.registry.unregister(job.id).await;
            return Err(e.into());
        }

        info!(job_id = %job.id, next_fire_at = ?job.next_fire_at, "Job added");
        Ok(job)
    }

    /// Apply a partial update and re-register the job
    #[instrument(skip(self, update))]
    pub async fn update_job(
        &self,
        job_id: Uuid,
        update: JobUpdate,
    ) -> Result<ScheduledJob, EngineError> {
        let _mutating = self.mutations.lock().await;
        self.update_job_locked(job_id, update).await
    }

    /// `update_job` body; callers hold the mutation lock
    async fn update_job_locked(
        &self,
        job_id: Uuid,
        update: JobUpdate,
    ) -> Result<ScheduledJob, EngineError> {
        let previous = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;

        let mut job = previous.clone();
        job.apply(update);
        job.validate()?;

        self.arm(&mut job).await?;
        if let Err(e) = self.store.update_job(&job).await {
            // Put the registry back in line with what is persisted
            let mut previous = previous;
            if let Err(rearm) = self.arm(&mut previous).await {
                warn!(error = %rearm, "Failed to restore previous registration");
            }
            return Err(e.into());
        }

        info!(enabled = job.enabled, next_fire_at = ?job.next_fire_at, "Job updated");
        Ok(job)
    }

    /// Delete a job and cancel its timer
    #[instrument(skip(self))]
    pub async fn remove_job(&self, job_id: Uuid) -> Result<(), EngineError> {
        let _mutating = self.mutations.lock().await;
        if !self.store.delete_job(job_id).await? {
            return Err(EngineError::JobNotFound(job_id));
        }
        self.registry.unregister(job_id).await;
        info!("Job removed");
        Ok(())
    }

    /// Run a job immediately through the coordinator, regardless of its
    /// schedule. A run already in progress makes this a skip.
    #[instrument(skip(self))]
    pub async fn run_now(&self, job_id: Uuid) -> Result<ExecutionOutcome, EngineError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        Ok(self.coordinator.execute(&job, TriggerSource::Manual).await)
    }

    pub async fn list_scheduled(&self) -> Vec<ScheduledEntry> {
        self.registry.list_scheduled().await
    }

    pub async fn schedule_status(&self, job_id: Uuid) -> Result<ScheduleStatus, EngineError> {
        if let Some(status) = self.registry.status(job_id).await {
            return Ok(status);
        }
        match self.store.get_job(job_id).await? {
            None => Err(EngineError::JobNotFound(job_id)),
            Some(job) if !job.enabled => Ok(ScheduleStatus::NotScheduled {
                reason: "job is disabled".to_string(),
            }),
            Some(_) => Ok(ScheduleStatus::NotScheduled {
                reason: "job has not been loaded yet".to_string(),
            }),
        }
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.coordinator.is_running(job_id)
    }

    /// Re-arm every enabled job from the store, dropping all current timers.
    /// While this engine has nothing in flight, runs still marked `running`
    /// are closed as failed first. Returns how many jobs were armed.
    #[instrument(skip(self))]
    pub async fn reload_from_store(&self) -> Result<usize, EngineError> {
        let _mutating = self.mutations.lock().await;

        if self.coordinator.running_count() == 0 {
            let interrupted = self
                .store
                .fail_interrupted_runs(INTERRUPTED_RUN_MESSAGE)
                .await?;
            if interrupted > 0 {
                warn!(interrupted, "Closed runs left running by a previous process");
            }
        }

        let jobs = self.store.list_enabled_jobs().await?;
        self.registry.teardown().await;

        let mut armed = 0;
        for job in &jobs {
            match self.registry.register(job).await {
                Ok(next) => {
                    armed += 1;
                    if job.next_fire_at != Some(next) {
                        if let Err(e) = self.store.set_next_fire_at(job.id, Some(next)).await {
                            warn!(job_id = %job.id, error = %e, "Failed to persist next fire time");
                        }
                    }
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Stored job cannot be scheduled");
                    if let Err(e) = self.store.set_next_fire_at(job.id, None).await {
                        warn!(job_id = %job.id, error = %e, "Failed to clear next fire time");
                    }
                }
            }
        }

        info!(total = jobs.len(), armed, "Jobs reloaded from store");
        Ok(armed)
    }

    // ------------------------------------------------------------------
    // Previews and policies
    // ------------------------------------------------------------------

    pub fn preview_stagger(
        &self,
        count: u32,
        window: &StaggerWindow,
    ) -> Result<Vec<String>, EngineError> {
        Ok(stagger::preview(count, window)?)
    }

    /// Dry run of retention cleanup: what would be kept and deleted, per
    /// database. Runs whether or not the policy is enabled.
    #[instrument(skip(self))]
    pub async fn preview_retention(
        &self,
        database_id: Option<&str>,
    ) -> Result<Vec<RetentionPreview>, EngineError> {
        let policy: RetentionPolicy = load_policy(self.store.as_ref()).await?;
        let databases = match database_id {
            Some(database_id) => vec![database_id.to_string()],
            None => self.store.list_databases().await?,
        };

        let mut previews = Vec::with_capacity(databases.len());
        for database_id in databases {
            let files = self.store.list_backup_files(&database_id).await?;
            let plan = retention::plan(&files, &policy);
            previews.push(RetentionPreview::new(database_id, policy.clone(), plan));
        }
        Ok(previews)
    }

    pub async fn retention_policy(&self) -> Result<RetentionPolicy, EngineError> {
        Ok(load_policy(self.store.as_ref()).await?)
    }

    /// Persist the retention policy and move global cleanup jobs onto its schedule
    #[instrument(skip(self, policy), fields(enabled = policy.enabled))]
    pub async fn set_retention_policy(&self, policy: RetentionPolicy) -> Result<(), EngineError> {
        policy.validate()?;
        let _mutating = self.mutations.lock().await;
        save_policy(self.store.as_ref(), &policy).await?;

        let cleanup_jobs = self.store.list_jobs().await?.into_iter().filter(|job| {
            job.kind == JobKind::Cleanup
                && job.resource_key.is_none()
                && job.cron_expression != policy.schedule
        });
        for job in cleanup_jobs {
            let update = JobUpdate {
                cron_expression: Some(policy.schedule.clone()),
                ..Default::default()
            };
            self.update_job_locked(job.id, update).await?;
        }

        info!("Retention policy updated");
        Ok(())
    }

    pub async fn bandwidth_policy(&self) -> Result<BandwidthPolicy, EngineError> {
        Ok(load_policy(self.store.as_ref()).await?)
    }

    #[instrument(skip(self, policy), fields(enabled = policy.enabled))]
    pub async fn set_bandwidth_policy(&self, policy: BandwidthPolicy) -> Result<(), EngineError> {
        policy.validate()?;
        save_policy(self.store.as_ref(), &policy).await?;
        info!("Bandwidth policy updated");
        Ok(())
    }

    pub async fn sync_settings(&self) -> Result<SyncSettings, EngineError> {
        Ok(load_policy(self.store.as_ref()).await?)
    }

    /// Persist the sync settings and re-arm the sync trigger immediately
    #[instrument(skip(self, settings), fields(mode = ?settings.mode))]
    pub async fn set_sync_settings(&self, settings: SyncSettings) -> Result<(), EngineError> {
        settings.validate()?;
        save_policy(self.store.as_ref(), &settings).await?;
        self.sync_trigger.apply(&settings);
        Ok(())
    }

    /// When the next policy-triggered sync fires, if one is armed
    pub fn pending_sync_at(&self) -> Option<DateTime<Utc>> {
        self.sync_trigger.pending_fire_at()
    }

    // ------------------------------------------------------------------
    // Trigger loop
    // ------------------------------------------------------------------

    /// Register or unregister `job` according to `enabled`, recording the
    /// resulting next fire time on the job
    async fn arm(&self, job: &mut ScheduledJob) -> Result<(), EngineError> {
        if job.enabled {
            let next = self.registry.register(job).await?;
            job.next_fire_at = Some(next);
        } else {
            self.registry.unregister(job.id).await;
            job.next_fire_at = None;
        }
        Ok(())
    }

    async fn dispatch(&self, request: DispatchRequest, runs: &mut JoinSet<()>) {
        let trigger = request.trigger;
        match request.target {
            DispatchTarget::Job { job_id, generation } => {
                if !self
                    .registry
                    .record_fire(job_id, generation, request.next_fire_at)
                    .await
                {
                    debug!(job_id = %job_id, generation, "Dropping fire from a replaced timer");
                    return;
                }

                let store = self.store.clone();
                let next_fire_at = request.next_fire_at;
                tokio::spawn(async move {
                    if let Err(e) = store.set_next_fire_at(job_id, next_fire_at).await {
                        warn!(job_id = %job_id, error = %e, "Failed to persist next fire time");
                    }
                });

                debug!(job_id = %job_id, fired_at = %request.fired_at, "Dispatching job");
                runs.spawn(run_job(
                    self.store.clone(),
                    self.coordinator.clone(),
                    job_id,
                    trigger,
                ));
            }
            DispatchTarget::PolicySync => {
                debug!(trigger = %trigger, "Dispatching policy sync");
                runs.spawn(run_policy_sync(
                    self.store.clone(),
                    self.coordinator.clone(),
                    trigger,
                ));
            }
        }
    }

    /// Cancel all timers, then give in-flight runs the grace period
    async fn drain(&self, mut runs: JoinSet<()>) {
        self.registry.teardown().await;
        self.sync_trigger.shutdown();

        if !runs.is_empty() {
            info!(
                in_flight = runs.len(),
                grace_seconds = self.config.shutdown_grace.as_secs(),
                "Waiting for in-flight runs"
            );
        }

        let wait = async {
            while let Some(joined) = runs.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Run task ended abnormally");
                }
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, wait)
            .await
            .is_err()
        {
            warn!(
                remaining = runs.len(),
                "Shutdown grace elapsed, aborting in-flight runs"
            );
            runs.shutdown().await;
        }
    }
}

async fn run_job(
    store: Arc<dyn JobStore>,
    coordinator: Arc<ExecutionCoordinator>,
    job_id: Uuid,
    trigger: TriggerSource,
) {
    let job = match store.get_job(job_id).await {
        Ok(Some(job)) if job.enabled => job,
        Ok(_) => {
            debug!(job_id = %job_id, "Job was removed or disabled after it fired");
            return;
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to load fired job");
            return;
        }
    };
    coordinator.execute(&job, trigger).await;
}

async fn run_policy_sync(
    store: Arc<dyn JobStore>,
    coordinator: Arc<ExecutionCoordinator>,
    trigger: TriggerSource,
) {
    match find_sync_job(store.as_ref()).await {
        Ok(Some(job)) => {
            coordinator.execute(&job, trigger).await;
        }
        Ok(None) => warn!("Policy sync fired but no enabled sync job exists"),
        Err(e) => error!(error = %e, "Failed to look up the sync job"),
    }
}

/// The oldest enabled sync job
async fn find_sync_job(store: &dyn JobStore) -> Result<Option<ScheduledJob>, StorageError> {
    Ok(store
        .list_enabled_jobs()
        .await?
        .into_iter()
        .filter(|job| job.kind == JobKind::Sync)
        .min_by_key(|job| job.created_at))
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), EngineError> {
        let mut dispatch_rx = self
            .dispatch_rx
            .lock()
            .await
            .take()
            .ok_or(EngineError::AlreadyStarted)?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let armed = self.reload_from_store().await?;
        if let Err(e) = self.sync_trigger.reconcile().await {
            warn!(error = %e, "Failed to arm sync trigger from stored settings");
        }
        info!(armed, timezone = %self.config.timezone, "Scheduler engine started");

        let mut runs = JoinSet::new();
        let mut stopping = *shutdown_rx.borrow_and_update();
        while !stopping {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    stopping = changed.is_err() || *shutdown_rx.borrow_and_update();
                }
                request = dispatch_rx.recv() => match request {
                    Some(request) => self.dispatch(request, &mut runs).await,
                    None => stopping = true,
                },
                Some(joined) = runs.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Run task ended abnormally");
                    }
                }
            }
        }

        info!("Shutdown signal received, stopping trigger loop");
        self.drain(runs).await;
        info!("Scheduler engine stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), EngineError> {
        info!("Stopping scheduler engine");
        self.shutdown_tx.send_replace(true);
        Ok(())
    }
}

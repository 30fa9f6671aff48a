// Schedule registry
//
// One entry per registered job. Each (re)registration bumps a generation
// counter and replaces the entry; dropping an entry aborts its timer. Fires
// from a replaced timer that were already queued carry an old generation and
// are rejected by `record_fire`.

use crate::errors::ScheduleError;
use crate::models::{JobKind, ScheduledJob, TriggerSource};
use crate::schedule::next_fire_time;
use crate::scheduler::dispatch::{spawn_cron_timer, DispatchSender, DispatchTarget};
use crate::telemetry;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Whether a job currently has a live timer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScheduleStatus {
    Scheduled { next_fire_at: DateTime<Utc> },
    NotScheduled { reason: String },
}

/// A registered, armed job as reported by `list_scheduled`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub job_id: Uuid,
    pub name: String,
    pub kind: JobKind,
    pub cron_expression: String,
    pub resource_key: Option<String>,
    pub next_fire_at: DateTime<Utc>,
}

struct Timer(JoinHandle<()>);

impl Drop for Timer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum EntryState {
    Armed {
        next_fire_at: DateTime<Utc>,
        _timer: Timer,
    },
    NotScheduled {
        reason: String,
    },
}

struct Entry {
    name: String,
    kind: JobKind,
    cron_expression: String,
    resource_key: Option<String>,
    generation: u64,
    state: EntryState,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Uuid, Entry>,
    next_generation: u64,
}

impl Inner {
    fn armed_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry.state, EntryState::Armed { .. }))
            .count()
    }
}

/// ScheduleRegistry maps job ids to their live timers
pub struct ScheduleRegistry {
    timezone: Tz,
    dispatch: DispatchSender,
    inner: Mutex<Inner>,
}

impl ScheduleRegistry {
    pub fn new(timezone: Tz, dispatch: DispatchSender) -> Self {
        Self {
            timezone,
            dispatch,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Arm a timer for `job`, replacing any existing one.
    ///
    /// When the cron expression can no longer be evaluated the job is kept
    /// as "not scheduled" with the reason, and the error is returned.
    #[instrument(skip(self, job), fields(job_id = %job.id, cron = %job.cron_expression))]
    pub async fn register(&self, job: &ScheduledJob) -> Result<DateTime<Utc>, ScheduleError> {
        let mut inner = self.inner.lock().await;
        inner.next_generation += 1;
        let generation = inner.next_generation;

        // Drop the old timer before computing anything new
        inner.entries.remove(&job.id);

        let first = next_fire_time(&job.cron_expression, Utc::now(), self.timezone);
        let (state, result) = match first {
            Ok(first) => {
                let handle = spawn_cron_timer(
                    job.cron_expression.clone(),
                    self.timezone,
                    first,
                    DispatchTarget::Job {
                        job_id: job.id,
                        generation,
                    },
                    TriggerSource::Scheduled,
                    self.dispatch.clone(),
                    |_| {},
                );
                debug!(next_fire_at = %first, generation, "Job armed");
                (
                    EntryState::Armed {
                        next_fire_at: first,
                        _timer: Timer(handle),
                    },
                    Ok(first),
                )
            }
            Err(e) => {
                error!(error = %e, "Job cannot be scheduled, leaving it unarmed");
                (
                    EntryState::NotScheduled {
                        reason: e.to_string(),
                    },
                    Err(ScheduleError::Unschedulable {
                        job_id: job.id,
                        reason: e.to_string(),
                    }),
                )
            }
        };

        inner.entries.insert(
            job.id,
            Entry {
                name: job.name.clone(),
                kind: job.kind,
                cron_expression: job.cron_expression.clone(),
                resource_key: job.resource_key.clone(),
                generation,
                state,
            },
        );
        telemetry::update_scheduled_jobs(inner.armed_count());
        result
    }

    /// Cancel the job's timer. Returns whether the job was registered.
    pub async fn unregister(&self, job_id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.entries.remove(&job_id).is_some();
        if removed {
            debug!(job_id = %job_id, "Job unregistered");
        }
        telemetry::update_scheduled_jobs(inner.armed_count());
        removed
    }

    /// Accept a fire from the timer of `generation` and record the
    /// occurrence it re-armed for. Returns false for fires of a timer that
    /// has since been replaced or cancelled.
    pub async fn record_fire(
        &self,
        job_id: Uuid,
        generation: u64,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(&job_id) else {
            return false;
        };
        if entry.generation != generation {
            return false;
        }

        match (&mut entry.state, next_fire_at) {
            (EntryState::Armed { next_fire_at, .. }, Some(next)) => {
                *next_fire_at = next;
            }
            (EntryState::Armed { .. }, None) => {
                // The timer task has exited; nothing left to abort
                entry.state = EntryState::NotScheduled {
                    reason: "cron expression has no further occurrence".to_string(),
                };
                let armed = inner.armed_count();
                telemetry::update_scheduled_jobs(armed);
            }
            (EntryState::NotScheduled { .. }, _) => return false,
        }
        true
    }

    /// Armed jobs, soonest first
    pub async fn list_scheduled(&self) -> Vec<ScheduledEntry> {
        let inner = self.inner.lock().await;
        let mut scheduled: Vec<ScheduledEntry> = inner
            .entries
            .iter()
            .filter_map(|(job_id, entry)| match entry.state {
                EntryState::Armed { next_fire_at, .. } => Some(ScheduledEntry {
                    job_id: *job_id,
                    name: entry.name.clone(),
                    kind: entry.kind,
                    cron_expression: entry.cron_expression.clone(),
                    resource_key: entry.resource_key.clone(),
                    next_fire_at,
                }),
                EntryState::NotScheduled { .. } => None,
            })
            .collect();
        scheduled.sort_by(|a, b| {
            a.next_fire_at
                .cmp(&b.next_fire_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        scheduled
    }

    /// Status of a registered job; `None` if the job is not registered
    pub async fn status(&self, job_id: Uuid) -> Option<ScheduleStatus> {
        let inner = self.inner.lock().await;
        inner.entries.get(&job_id).map(|entry| match &entry.state {
            EntryState::Armed { next_fire_at, .. } => ScheduleStatus::Scheduled {
                next_fire_at: *next_fire_at,
            },
            EntryState::NotScheduled { reason } => ScheduleStatus::NotScheduled {
                reason: reason.clone(),
            },
        })
    }

    pub async fn is_registered(&self, job_id: Uuid) -> bool {
        self.inner.lock().await.entries.contains_key(&job_id)
    }

    /// Cancel every outstanding timer
    pub async fn teardown(&self) {
        let mut inner = self.inner.lock().await;
        let count = inner.entries.len();
        inner.entries.clear();
        telemetry::update_scheduled_jobs(0);
        info!(cancelled = count, "Schedule registry torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewJob;
    use crate::scheduler::dispatch::{dispatch_channel, DispatchReceiver};
    use std::time::Duration;

    fn job(cron: &str) -> ScheduledJob {
        ScheduledJob::from_new(NewJob {
            name: "nightly".to_string(),
            kind: JobKind::Backup,
            cron_expression: cron.to_string(),
            resource_key: Some("sales".to_string()),
            enabled: true,
            options: serde_json::Value::Null,
        })
    }

    fn registry() -> (ScheduleRegistry, DispatchReceiver) {
        let (tx, rx) = dispatch_channel();
        (ScheduleRegistry::new(chrono_tz::UTC, tx), rx)
    }

    fn drain(rx: &mut DispatchReceiver) -> Vec<crate::scheduler::dispatch::DispatchRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = rx.try_recv() {
            requests.push(request);
        }
        requests
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_arms_and_fires() {
        let (registry, mut rx) = registry();
        let job = job("* * * * *");

        let next = registry.register(&job).await.unwrap();
        assert_eq!(
            registry.status(job.id).await,
            Some(ScheduleStatus::Scheduled { next_fire_at: next })
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        let requests = drain(&mut rx);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].fired_at, next);
        assert!(matches!(
            requests[0].target,
            DispatchTarget::Job { job_id, .. } if job_id == job.id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_does_not_duplicate_fires() {
        let (registry, mut rx) = registry();
        let job = job("* * * * *");

        registry.register(&job).await.unwrap();
        registry.register(&job).await.unwrap();
        registry.register(&job).await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        let requests = drain(&mut rx);
        assert_eq!(requests.len(), 1);
        assert_eq!(registry.list_scheduled().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_generation_is_rejected() {
        let (registry, _rx) = registry();
        let job = job("0 2 * * *");

        registry.register(&job).await.unwrap();
        registry.register(&job).await.unwrap();

        // First registration had generation 1, the live one has 2
        assert!(!registry.record_fire(job.id, 1, None).await);
        let later = Utc::now() + chrono::Duration::days(3);
        assert!(registry.record_fire(job.id, 2, Some(later)).await);
        assert_eq!(
            registry.status(job.id).await,
            Some(ScheduleStatus::Scheduled { next_fire_at: later })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_cancels_timer() {
        let (registry, mut rx) = registry();
        let job = job("* * * * *");

        registry.register(&job).await.unwrap();
        assert!(registry.unregister(job.id).await);
        assert!(!registry.unregister(job.id).await);

        tokio::time::sleep(Duration::from_secs(180)).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.status(job.id).await, None);
    }

    #[tokio::test]
    async fn test_unparseable_cron_is_kept_not_scheduled() {
        let (registry, _rx) = registry();
        let job = job("not a cron");

        let result = registry.register(&job).await;
        assert!(matches!(result, Err(ScheduleError::Unschedulable { .. })));
        assert!(matches!(
            registry.status(job.id).await,
            Some(ScheduleStatus::NotScheduled { .. })
        ));
        assert!(registry.list_scheduled().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_scheduled_is_ordered_by_next_fire() {
        let (registry, _rx) = registry();
        let hourly = job("0 * * * *");
        let yearly = job("0 0 1 1 *");

        registry.register(&yearly).await.unwrap();
        registry.register(&hourly).await.unwrap();

        let scheduled = registry.list_scheduled().await;
        assert_eq!(scheduled.len(), 2);
        assert_eq!(scheduled[0].job_id, hourly.id);
        assert_eq!(scheduled[1].job_id, yearly.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_everything() {
        let (registry, mut rx) = registry();
        registry.register(&job("* * * * *")).await.unwrap();
        registry.register(&job("* * * * *")).await.unwrap();

        registry.teardown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(drain(&mut rx).is_empty());
        assert!(registry.list_scheduled().await.is_empty());
    }
}

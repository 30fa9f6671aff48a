// Policy-driven sync trigger
//
// A single slot holds the one pending sync timer. Every arm replaces (and
// aborts) whatever was there, so a burst of backup completions collapses
// into one fire.

use crate::errors::{ScheduleError, StorageError};
use crate::models::TriggerSource;
use crate::policy::{SyncMode, SyncSettings};
use crate::schedule::next_fire_time;
use crate::scheduler::dispatch::{
    delay_until, spawn_cron_timer, DispatchRequest, DispatchSender, DispatchTarget,
};
use crate::store::{load_policy, JobStore};
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

struct Pending {
    mode: SyncMode,
    /// Updated by the timer task; `None` once a one-shot timer has fired
    next_fire_at: Arc<Mutex<Option<DateTime<Utc>>>>,
    handle: JoinHandle<()>,
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Default)]
struct Slot {
    pending: Option<Pending>,
    last_backup_completed_at: Option<DateTime<Utc>>,
}

/// SyncTrigger arms the policy sync timer according to the sync settings
pub struct SyncTrigger {
    store: Arc<dyn JobStore>,
    dispatch: DispatchSender,
    timezone: Tz,
    slot: Mutex<Slot>,
}

impl SyncTrigger {
    pub fn new(store: Arc<dyn JobStore>, dispatch: DispatchSender, timezone: Tz) -> Self {
        Self {
            store,
            dispatch,
            timezone,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// A backup or maintenance run finished successfully
    #[instrument(skip(self))]
    pub async fn on_backup_completed(&self, completed_at: DateTime<Utc>) {
        let settings: SyncSettings = match load_policy(self.store.as_ref()).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Failed to load sync settings, not arming sync");
                return;
            }
        };

        let mut slot = self.lock_slot();
        slot.last_backup_completed_at = Some(
            slot.last_backup_completed_at
                .map_or(completed_at, |last| last.max(completed_at)),
        );

        if settings.mode != SyncMode::AfterBackups {
            return;
        }

        let fire_at = completed_at + Duration::minutes(i64::from(settings.buffer_minutes));
        debug!(fire_at = %fire_at, "Re-arming debounced sync");
        slot.pending = Some(self.arm_once(fire_at));
    }

    /// Re-read the sync settings and re-arm from scratch
    pub async fn reconcile(&self) -> Result<(), StorageError> {
        let settings: SyncSettings = load_policy(self.store.as_ref()).await?;
        self.apply(&settings);
        Ok(())
    }

    /// Re-arm for the given settings, cancelling whatever was pending
    pub fn apply(&self, settings: &SyncSettings) {
        let mut slot = self.lock_slot();
        slot.pending = None;

        match settings.mode {
            SyncMode::Manual => {
                info!("Sync mode is manual, no sync timer armed");
            }
            SyncMode::AfterBackups => {
                // Carry an unexpired debounce window over to the new buffer
                let fire_at = slot.last_backup_completed_at.map(|last| {
                    last + Duration::minutes(i64::from(settings.buffer_minutes))
                });
                if let Some(fire_at) = fire_at.filter(|at| *at > Utc::now()) {
                    slot.pending = Some(self.arm_once(fire_at));
                }
                info!(
                    buffer_minutes = settings.buffer_minutes,
                    "Sync will follow backup completions"
                );
            }
            SyncMode::Scheduled => match self.arm_daily(settings.sync_time) {
                Ok(pending) => {
                    info!(sync_time = %settings.sync_time, "Daily sync armed");
                    slot.pending = Some(pending);
                }
                Err(e) => warn!(error = %e, "Failed to arm daily sync"),
            },
        }
    }

    /// When the next policy sync will fire, if one is armed
    pub fn pending_fire_at(&self) -> Option<DateTime<Utc>> {
        let slot = self.lock_slot();
        let pending = slot.pending.as_ref()?;
        let next = *pending
            .next_fire_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        next
    }

    pub fn pending_mode(&self) -> Option<SyncMode> {
        self.lock_slot().pending.as_ref().map(|pending| pending.mode)
    }

    /// Cancel the pending timer
    pub fn shutdown(&self) {
        self.lock_slot().pending = None;
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm_once(&self, fire_at: DateTime<Utc>) -> Pending {
        let next_fire_at = Arc::new(Mutex::new(Some(fire_at)));
        let shared = next_fire_at.clone();
        let dispatch = self.dispatch.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay_until(fire_at)).await;
            *shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;

            let request = DispatchRequest {
                target: DispatchTarget::PolicySync,
                trigger: TriggerSource::AfterBackups,
                fired_at: fire_at,
                next_fire_at: None,
            };
            if dispatch.send(request).is_err() {
                debug!("Trigger loop is gone, dropping sync fire");
            }
        });

        Pending {
            mode: SyncMode::AfterBackups,
            next_fire_at,
            handle,
        }
    }

    fn arm_daily(&self, sync_time: NaiveTime) -> Result<Pending, ScheduleError> {
        let expression = daily_expression(sync_time);
        let first = next_fire_time(&expression, Utc::now(), self.timezone)?;

        let next_fire_at = Arc::new(Mutex::new(Some(first)));
        let shared = next_fire_at.clone();
        let handle = spawn_cron_timer(
            expression,
            self.timezone,
            first,
            DispatchTarget::PolicySync,
            TriggerSource::SyncSchedule,
            self.dispatch.clone(),
            move |following| {
                *shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = following;
            },
        );

        Ok(Pending {
            mode: SyncMode::Scheduled,
            next_fire_at,
            handle,
        })
    }
}

fn daily_expression(time: NaiveTime) -> String {
    format!("{} {} * * *", time.minute(), time.hour())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SettingsRecord;
    use crate::scheduler::dispatch::{dispatch_channel, DispatchReceiver};
    use crate::store::{save_policy, BackupDirectory, MemoryJobStore};
    use std::time::Duration as StdDuration;

    async fn trigger_with(settings: SyncSettings) -> (SyncTrigger, DispatchReceiver) {
        let store = Arc::new(MemoryJobStore::new(BackupDirectory::new("/nonexistent")));
        save_policy(store.as_ref(), &settings).await.unwrap();
        let (tx, rx) = dispatch_channel();
        (SyncTrigger::new(store, tx, chrono_tz::UTC), rx)
    }

    fn after_backups(buffer_minutes: u32) -> SyncSettings {
        SyncSettings {
            mode: SyncMode::AfterBackups,
            buffer_minutes,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_backups_fires_once() {
        let (trigger, mut rx) = trigger_with(after_backups(30)).await;
        let t = Utc::now();

        trigger.on_backup_completed(t).await;
        trigger.on_backup_completed(t + Duration::minutes(2)).await;
        trigger.on_backup_completed(t + Duration::minutes(4)).await;

        assert_eq!(trigger.pending_fire_at(), Some(t + Duration::minutes(34)));

        tokio::time::sleep(StdDuration::from_secs(33 * 60)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(StdDuration::from_secs(2 * 60)).await;
        let request = rx.try_recv().unwrap();
        assert_eq!(request.target, DispatchTarget::PolicySync);
        assert_eq!(request.trigger, TriggerSource::AfterBackups);
        assert_eq!(request.fired_at, t + Duration::minutes(34));

        tokio::time::sleep(StdDuration::from_secs(3600)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(trigger.pending_fire_at(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_mode_arms_nothing() {
        let (trigger, mut rx) = trigger_with(SyncSettings::default()).await;
        trigger.on_backup_completed(Utc::now()).await;
        trigger.reconcile().await.unwrap();

        assert_eq!(trigger.pending_fire_at(), None);
        tokio::time::sleep(StdDuration::from_secs(2 * 86_400)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_mode_arms_daily_time() {
        let settings = SyncSettings {
            mode: SyncMode::Scheduled,
            sync_time: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
            ..Default::default()
        };
        let (trigger, _rx) = trigger_with(settings).await;
        trigger.reconcile().await.unwrap();

        let expected = next_fire_time("0 3 * * *", Utc::now(), chrono_tz::UTC).unwrap();
        assert_eq!(trigger.pending_fire_at(), Some(expected));
        assert_eq!(trigger.pending_mode(), Some(SyncMode::Scheduled));

        // Backup completions do not move a scheduled sync
        trigger.on_backup_completed(Utc::now()).await;
        assert_eq!(trigger.pending_fire_at(), Some(expected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_to_manual_cancels_pending() {
        let (trigger, mut rx) = trigger_with(after_backups(10)).await;
        trigger.on_backup_completed(Utc::now()).await;
        assert!(trigger.pending_fire_at().is_some());

        trigger.apply(&SyncSettings::default());
        assert_eq!(trigger.pending_fire_at(), None);

        tokio::time::sleep(StdDuration::from_secs(3600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_daily_expression() {
        let time = NaiveTime::from_hms_opt(23, 45, 0).unwrap();
        assert_eq!(daily_expression(time), "45 23 * * *");
        assert_eq!(SyncSettings::PREFIX, "sync");
    }
}

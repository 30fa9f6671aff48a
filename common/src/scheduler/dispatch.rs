// Messages from timers to the trigger loop

use crate::models::TriggerSource;
use crate::schedule::next_fire_time;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// What a fired timer wants executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTarget {
    /// A registered job, tagged with the registration generation that armed it
    Job { job_id: Uuid, generation: u64 },
    /// The sync job, on behalf of the sync trigger
    PolicySync,
}

/// DispatchRequest is sent by a timer when it fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub target: DispatchTarget,
    pub trigger: TriggerSource,
    pub fired_at: DateTime<Utc>,
    /// Occurrence the timer re-armed itself for, if any
    pub next_fire_at: Option<DateTime<Utc>>,
}

pub type DispatchSender = mpsc::UnboundedSender<DispatchRequest>;
pub type DispatchReceiver = mpsc::UnboundedReceiver<DispatchRequest>;

pub fn dispatch_channel() -> (DispatchSender, DispatchReceiver) {
    mpsc::unbounded_channel()
}

/// Time left until `at`; zero when it is already in the past
pub fn delay_until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Reference point for the occurrence after `fired`. Normally the fire time
/// itself; after a stall (suspend, overloaded runtime) the wall clock, so
/// missed occurrences are not replayed one by one.
pub fn rearm_reference(fired: DateTime<Utc>) -> DateTime<Utc> {
    fired.max(Utc::now())
}

/// Spawn a recurring cron timer.
///
/// The task sleeps until `first`, sends a request for `target`, re-arms for
/// the next occurrence and repeats. `on_rearm` sees every next fire time
/// (`None` once the expression has no further occurrence). The task ends when
/// the trigger loop is gone or the handle is aborted.
pub fn spawn_cron_timer<F>(
    expression: String,
    timezone: Tz,
    first: DateTime<Utc>,
    target: DispatchTarget,
    trigger: TriggerSource,
    dispatch: DispatchSender,
    on_rearm: F,
) -> JoinHandle<()>
where
    F: Fn(Option<DateTime<Utc>>) + Send + 'static,
{
    tokio::spawn(async move {
        let mut fire_at = first;
        loop {
            tokio::time::sleep(delay_until(fire_at)).await;

            let following = match next_fire_time(&expression, rearm_reference(fire_at), timezone) {
                Ok(next) => Some(next),
                Err(e) => {
                    warn!(expression = %expression, error = %e, "Timer has no further occurrence");
                    None
                }
            };
            on_rearm(following);

            let request = DispatchRequest {
                target,
                trigger,
                fired_at: fire_at,
                next_fire_at: following,
            };
            if dispatch.send(request).is_err() {
                debug!(expression = %expression, "Trigger loop is gone, stopping timer");
                break;
            }

            match following {
                Some(next) => fire_at = next,
                None => break,
            }
        }
    })
}

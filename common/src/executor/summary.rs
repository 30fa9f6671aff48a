// Daily summary executor

use super::{ExecutionReport, JobExecutor};
use crate::errors::ExecutionError;
use crate::models::{
    DailySummary, FailedRunSummary, JobKind, JobRun, RunMetrics, RunStatus, ScheduledJob,
};
use crate::notify::Notifier;
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct SummaryExecutor {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    timezone: Tz,
}

impl SummaryExecutor {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<dyn Notifier>, timezone: Tz) -> Self {
        Self {
            store,
            notifier,
            timezone,
        }
    }
}

/// First instant of `date` in `timezone`
fn start_of_local_day(date: NaiveDate, timezone: &Tz) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    match timezone.from_local_datetime(&midnight).earliest() {
        Some(start) => start.with_timezone(&Utc),
        // Midnight skipped by a DST change; the day starts an hour later
        None => timezone
            .from_local_datetime(&(midnight + Duration::hours(1)))
            .earliest()
            .map(|start| start.with_timezone(&Utc))
            .unwrap_or_else(|| midnight.and_utc()),
    }
}

/// UTC bounds `[from, to)` of the local day before the one containing `now`
pub fn previous_day_bounds(
    now: DateTime<Utc>,
    timezone: &Tz,
) -> (NaiveDate, DateTime<Utc>, DateTime<Utc>) {
    let today = now.with_timezone(timezone).date_naive();
    let yesterday = today.pred_opt().unwrap_or(today);
    (
        yesterday,
        start_of_local_day(yesterday, timezone),
        start_of_local_day(today, timezone),
    )
}

/// Aggregate a day's runs
pub fn build_summary(date: NaiveDate, runs: &[JobRun]) -> DailySummary {
    let mut summary = DailySummary {
        date,
        total_runs: runs.len() as u64,
        succeeded: 0,
        failed: 0,
        partial: 0,
        still_running: 0,
        by_kind: BTreeMap::new(),
        bytes_backed_up: 0,
        failures: Vec::new(),
    };

    for run in runs {
        let stats = summary.by_kind.entry(run.kind).or_default();
        stats.runs += 1;
        match run.status {
            RunStatus::Success => {
                summary.succeeded += 1;
                stats.succeeded += 1;
                if run.kind == JobKind::Backup {
                    summary.bytes_backed_up += run.metrics.bytes_moved.unwrap_or(0);
                }
            }
            RunStatus::Failed => {
                summary.failed += 1;
                stats.failed += 1;
                summary.failures.push(FailedRunSummary {
                    run_id: run.id,
                    job_id: run.job_id,
                    kind: run.kind,
                    started_at: run.started_at,
                    error_message: run.error_message.clone(),
                });
            }
            RunStatus::Partial => {
                summary.partial += 1;
                stats.partial += 1;
            }
            RunStatus::Running => summary.still_running += 1,
        }
    }

    summary.failures.sort_by_key(|failure| failure.started_at);
    summary
}

#[async_trait]
impl JobExecutor for SummaryExecutor {
    fn kind(&self) -> JobKind {
        JobKind::Summary
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn run(&self, job: &ScheduledJob) -> Result<ExecutionReport, ExecutionError> {
        let (date, from, to) = previous_day_bounds(Utc::now(), &self.timezone);
        let runs = self.store.list_runs_between(from, to).await?;
        let summary = build_summary(date, &runs);

        info!(
            date = %date,
            total_runs = summary.total_runs,
            failed = summary.failed,
            "Daily summary built"
        );

        let notifier = self.notifier.clone();
        let outgoing = summary.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify_daily_summary(&outgoing).await {
                warn!(date = %outgoing.date, error = %e, "Daily summary not delivered");
            }
        });

        Ok(ExecutionReport::success(RunMetrics {
            files_affected: Some(summary.total_runs),
            note: Some(format!(
                "{}: {} run(s), {} failed, {} partial",
                date, summary.total_runs, summary.failed, summary.partial
            )),
            ..Default::default()
        }))
    }
}

// Stagger generator: spreads N jobs evenly across a time window so bulk-created
// jobs do not all hit the database server at the same minute.

use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};

/// Saturday
pub const DEFAULT_WEEK_DAY: u8 = 6;

/// Recurrence of generated schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaggerScheduleType {
    Daily,
    Weekly,
}

/// Parameters shared by every job of one stagger batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaggerWindow {
    pub schedule_type: StaggerScheduleType,
    pub start_hour: u32,
    pub window_hours: u32,
    #[serde(default)]
    pub week_day: Option<u8>,
}

impl StaggerWindow {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.start_hour > 23 {
            return Err(invalid("start_hour", "must be between 0 and 23"));
        }
        if self.window_hours == 0 || self.window_hours > 24 {
            return Err(invalid("window_hours", "must be between 1 and 24"));
        }
        if let Some(day) = self.week_day {
            if day > 6 {
                return Err(invalid("week_day", "must be between 0 (Sunday) and 6"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidFieldValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Cron expression for job `index` of `total_jobs` spread across `window`.
///
/// Jobs are `floor(window_hours * 60 / total_jobs)` minutes apart. While
/// `total_jobs <= window_hours * 60` every index gets a distinct minute.
pub fn generate(
    index: u32,
    total_jobs: u32,
    window: &StaggerWindow,
) -> Result<String, ValidationError> {
    if total_jobs == 0 {
        return Err(invalid("total_jobs", "must be greater than 0"));
    }
    if index >= total_jobs {
        return Err(invalid("index", "must be lower than total_jobs"));
    }
    window.validate()?;

    let interval_minutes = window.window_hours * 60 / total_jobs;
    let offset_minutes = index * interval_minutes;
    let hour = (window.start_hour + offset_minutes / 60) % 24;
    let minute = offset_minutes % 60;

    let cron = match window.schedule_type {
        StaggerScheduleType::Daily => format!("{} {} * * *", minute, hour),
        StaggerScheduleType::Weekly => format!(
            "{} {} * * {}",
            minute,
            hour,
            window.week_day.unwrap_or(DEFAULT_WEEK_DAY)
        ),
    };
    Ok(cron)
}

/// Cron expressions for a whole batch of `count` jobs
pub fn preview(count: u32, window: &StaggerWindow) -> Result<Vec<String>, ValidationError> {
    if count == 0 {
        return Err(invalid("total_jobs", "must be greater than 0"));
    }
    (0..count).map(|index| generate(index, count, window)).collect()
}

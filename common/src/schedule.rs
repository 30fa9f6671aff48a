// Cron parsing and next fire time calculation
//
// Standard 5-field cron: minute, hour, day-of-month, month, day-of-week.
// Fields accept `*`, numbers, `a-b` ranges, comma lists and `/step`.
// Month and weekday fields also accept three-letter names (JAN, MON).
// When both day fields are restricted a day matches if either one does.

use crate::errors::ScheduleError;
use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;

/// How far ahead to search before declaring an expression unsatisfiable.
/// Covers the 8-year gap between leap days around century years.
const SEARCH_HORIZON_YEARS: i32 = 9;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: Option<(&'static [&'static str], u32)>,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: None,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: None,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: None,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: Some((&MONTH_NAMES, 1)),
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: Some((&WEEKDAY_NAMES, 0)),
};

/// A parsed cron expression
///
/// Each field is stored as a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    day_of_month_restricted: bool,
    day_of_week_restricted: bool,
}

impl CronExpression {
    /// The expression as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Earliest minute boundary strictly after `after` that satisfies every field.
    ///
    /// Evaluated in the time zone of `after`. Local times skipped by a DST
    /// transition never fire; repeated local times fire on the first occurrence
    /// that is still after `after`.
    pub fn next_after<T: TimeZone>(&self, after: &DateTime<T>) -> Option<DateTime<T>> {
        let tz = after.timezone();
        let start = after.naive_local();
        let horizon = start.year() + SEARCH_HORIZON_YEARS;

        let mut t = truncate_to_minute(start) + Duration::minutes(1);

        while t.year() <= horizon {
            if !bit(self.months, t.month()) {
                t = first_of_next_month(t.date());
                continue;
            }
            if !self.day_matches(t.date()) {
                t = start_of_day(t.date() + Duration::days(1));
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = truncate_to_hour(t) + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }

            match tz.from_local_datetime(&t) {
                LocalResult::Single(candidate) if candidate > *after => return Some(candidate),
                LocalResult::Ambiguous(earliest, latest) => {
                    if earliest > *after {
                        return Some(earliest);
                    }
                    if latest > *after {
                        return Some(latest);
                    }
                }
                _ => {}
            }
            t += Duration::minutes(1);
        }

        None
    }

    /// Whether the minute containing `at` satisfies every field
    pub fn matches<T: TimeZone>(&self, at: &DateTime<T>) -> bool {
        let local = at.naive_local();
        bit(self.minutes, local.minute())
            && bit(self.hours, local.hour())
            && bit(self.months, local.month())
            && self.day_matches(local.date())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.day_of_month_restricted && self.day_of_week_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronExpression {
    type Err = ScheduleError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ScheduleError::InvalidCronExpression {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let (minutes, _) = parse_field(fields[0], &MINUTE).map_err(invalid)?;
        let (hours, _) = parse_field(fields[1], &HOUR).map_err(invalid)?;
        let (days_of_month, day_of_month_restricted) =
            parse_field(fields[2], &DAY_OF_MONTH).map_err(invalid)?;
        let (months, _) = parse_field(fields[3], &MONTH).map_err(invalid)?;
        let (mut days_of_week, day_of_week_restricted) =
            parse_field(fields[4], &DAY_OF_WEEK).map_err(invalid)?;

        // 7 is an alias for Sunday
        if bit(days_of_week, 7) {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: fields.join(" "),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            day_of_month_restricted,
            day_of_week_restricted,
        })
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse one field into a bitmask. The flag reports whether the field
/// restricts values, i.e. does not start with `*`.
fn parse_field(raw: &str, spec: &FieldSpec) -> Result<(u64, bool), String> {
    let mut mask = 0u64;

    for part in raw.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in {} field", spec.name));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}' in {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (low, high) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((low, high)) = range.split_once('-') {
            let low = parse_value(low, spec)?;
            let high = parse_value(high, spec)?;
            if low > high {
                return Err(format!(
                    "range {}-{} is reversed in {} field",
                    low, high, spec.name
                ));
            }
            (low, high)
        } else {
            let value = parse_value(range, spec)?;
            // `a/n` means every n-th value starting at a
            match step {
                Some(_) => (value, spec.max),
                None => (value, value),
            }
        };

        let step = step.unwrap_or(1) as usize;
        for value in (low..=high).step_by(step) {
            mask |= 1 << value;
        }
    }

    Ok((mask, !raw.starts_with('*')))
}

fn parse_value(raw: &str, spec: &FieldSpec) -> Result<u32, String> {
    if let Some((names, offset)) = spec.names {
        let upper = raw.to_ascii_uppercase();
        if let Some(index) = names.iter().position(|name| *name == upper) {
            return Ok(index as u32 + offset);
        }
    }

    let value: u32 = raw
        .parse()
        .map_err(|_| format!("invalid value '{}' in {} field", raw, spec.name))?;
    if value < spec.min || value > spec.max {
        return Err(format!(
            "value {} out of range {}-{} in {} field",
            value, spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1 << value) != 0
}

fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn truncate_to_hour(t: NaiveDateTime) -> NaiveDateTime {
    truncate_to_minute(t).with_minute(0).unwrap_or(t)
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

fn first_of_next_month(date: NaiveDate) -> NaiveDateTime {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    // The first day of any month always exists
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date);
    start_of_day(first)
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronExpression, ScheduleError> {
    expression.parse()
}

/// Reject malformed expressions and expressions that can never fire
pub fn validate_cron_expression(expression: &str) -> Result<(), ScheduleError> {
    let cron = parse_cron_expression(expression)?;
    cron.next_after(&Utc::now())
        .map(|_| ())
        .ok_or_else(|| ScheduleError::NoNextExecution {
            expression: expression.to_string(),
        })
}

/// Next fire time of `expression` strictly after `after`, evaluated in `timezone`
pub fn next_fire_time(
    expression: &str,
    after: DateTime<Utc>,
    timezone: Tz,
) -> Result<DateTime<Utc>, ScheduleError> {
    let cron = parse_cron_expression(expression)?;
    cron.next_after(&after.with_timezone(&timezone))
        .map(|next| next.with_timezone(&Utc))
        .ok_or_else(|| ScheduleError::NoNextExecution {
            expression: expression.to_string(),
        })
}

/// Parse an IANA time zone name
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Get the default timezone for schedules
pub fn default_timezone() -> Tz {
    chrono_tz::UTC
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_valid_cron_expression() {
        assert!(parse_cron_expression("0 2 * * *").is_ok());
        assert!(parse_cron_expression("*/15 8-18 1,15 * MON-FRI").is_ok());
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        assert!(parse_cron_expression("0 0 12 * * *").is_err());
        assert!(parse_cron_expression("* * * *").is_err());
        assert!(parse_cron_expression("").is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_values() {
        assert!(parse_cron_expression("60 * * * *").is_err());
        assert!(parse_cron_expression("* 24 * * *").is_err());
        assert!(parse_cron_expression("* * 0 * *").is_err());
        assert!(parse_cron_expression("* * * 13 *").is_err());
        assert!(parse_cron_expression("* * * * 8").is_err());
        assert!(parse_cron_expression("*/0 * * * *").is_err());
        assert!(parse_cron_expression("5-1 * * * *").is_err());
        assert!(parse_cron_expression("1,,2 * * * *").is_err());
    }

    #[test]
    fn test_next_fire_is_strictly_after() {
        let after = utc(2024, 3, 5, 2, 0);
        let next = next_fire_time("0 2 * * *", after, chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 3, 6, 2, 0));
    }

    #[test]
    fn test_next_fire_with_seconds_rounds_up() {
        let after = Utc.with_ymd_and_hms(2024, 3, 5, 1, 59, 30).unwrap();
        let next = next_fire_time("0 2 * * *", after, chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 3, 5, 2, 0));
    }

    #[test]
    fn test_step_field() {
        let after = utc(2024, 3, 5, 10, 7);
        let next = next_fire_time("*/15 * * * *", after, chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 3, 5, 10, 15));
    }

    #[test]
    fn test_list_field_wraps_to_next_day() {
        let after = utc(2024, 3, 5, 23, 0);
        let next = next_fire_time("30 6,18 * * *", after, chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 3, 6, 6, 30));
    }

    #[test]
    fn test_day_fields_use_or_semantics_when_both_restricted() {
        // 2024-03-05 is a Tuesday. "1st of month OR Saturday" -> Saturday the 9th
        let after = utc(2024, 3, 5, 0, 0);
        let next = next_fire_time("0 0 1 * 6", after, chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 3, 9, 0, 0));
    }

    #[test]
    fn test_day_of_week_only() {
        let after = utc(2024, 3, 5, 0, 0);
        let next = next_fire_time("0 0 * * 0", after, chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 3, 10, 0, 0));
        let alias = next_fire_time("0 0 * * 7", after, chrono_tz::UTC).unwrap();
        assert_eq!(alias, next);
    }

    #[test]
    fn test_month_names_and_leap_day() {
        let after = utc(2024, 3, 1, 0, 0);
        let next = next_fire_time("0 0 29 FEB *", after, chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2028, 2, 29, 0, 0));
    }

    #[test]
    fn test_impossible_date_is_rejected() {
        assert!(matches!(
            validate_cron_expression("0 0 30 2 *"),
            Err(ScheduleError::NoNextExecution { .. })
        ));
    }

    #[test]
    fn test_timezone_evaluation() {
        // 02:00 in Ho Chi Minh (UTC+7) is 19:00 UTC the previous day
        let tz = parse_timezone("Asia/Ho_Chi_Minh").unwrap();
        let after = utc(2024, 3, 5, 12, 0);
        let next = next_fire_time("0 2 * * *", after, tz).unwrap();
        assert_eq!(next, utc(2024, 3, 5, 19, 0));
    }

    #[test]
    fn test_dst_gap_is_skipped() {
        // 2024-03-10 02:30 does not exist in New York
        let tz = parse_timezone("America/New_York").unwrap();
        let after = utc(2024, 3, 10, 5, 0);
        let next = next_fire_time("30 2 * * *", after, tz).unwrap();
        assert_eq!(next.with_timezone(&tz).day(), 11);
    }

    #[test]
    fn test_invalid_timezone() {
        assert!(parse_timezone("Mars/Olympus").is_err());
    }

    #[test]
    fn test_matches() {
        let cron = parse_cron_expression("15 10 * * 2").unwrap();
        assert!(cron.matches(&utc(2024, 3, 5, 10, 15)));
        assert!(!cron.matches(&utc(2024, 3, 6, 10, 15)));
    }
}

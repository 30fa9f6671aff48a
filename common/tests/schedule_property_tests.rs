// Property-based tests for cron evaluation

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use common::schedule::{next_fire_time, parse_cron_expression, validate_cron_expression};
use proptest::prelude::*;

/// Timestamps between 2000-01-01 and 2099-12-31
fn reference_time() -> impl Strategy<Value = DateTime<Utc>> {
    (946_684_800i64..4_102_358_400i64)
        .prop_map(|secs| Utc.timestamp_opt(secs, 0).single().unwrap())
}

fn field(value: Option<u32>) -> String {
    value.map_or_else(|| "*".to_string(), |v| v.to_string())
}

/// **Property: Next fire time is strictly after the reference and honours every field**
///
/// *For any* cron expression built from single values or wildcards, and any
/// reference time, the next fire time is later than the reference and
/// matches each restricted field. When both day fields are restricted,
/// either one matching is enough.
#[test]
fn property_next_fire_strictly_after_and_satisfies_fields() {
    proptest!(|(
        minute in proptest::option::of(0u32..60),
        hour in proptest::option::of(0u32..24),
        day in proptest::option::of(1u32..29),
        month in proptest::option::of(1u32..13),
        weekday in proptest::option::of(0u32..7),
        after in reference_time(),
    )| {
        let expression = format!(
            "{} {} {} {} {}",
            field(minute), field(hour), field(day), field(month), field(weekday)
        );
        let next = next_fire_time(&expression, after, chrono_tz::UTC).unwrap();

        prop_assert!(next > after, "{} not after {} for '{}'", next, after, expression);
        prop_assert_eq!(next.second(), 0);
        if let Some(minute) = minute {
            prop_assert_eq!(next.minute(), minute);
        }
        if let Some(hour) = hour {
            prop_assert_eq!(next.hour(), hour);
        }
        if let Some(month) = month {
            prop_assert_eq!(next.month(), month);
        }

        let fired_weekday = next.weekday().num_days_from_sunday();
        let day_ok = day.map_or(true, |day| next.day() == day);
        let weekday_ok = weekday.map_or(true, |weekday| fired_weekday == weekday);
        if day.is_some() && weekday.is_some() {
            prop_assert!(day_ok || weekday_ok, "'{}' fired on {}", expression, next);
        } else {
            prop_assert!(day_ok && weekday_ok, "'{}' fired on {}", expression, next);
        }
    });
}

/// **Property: Step and range fields are honoured**
///
/// *For any* `*/step` minute field and `a-b` hour range, the next fire time
/// matches the parsed expression and lies in the range.
#[test]
fn property_steps_and_ranges_match() {
    proptest!(|(
        step in 1u32..30,
        start in 0u32..12,
        len in 0u32..12,
        after in reference_time(),
    )| {
        let end = start + len;
        let expression = format!("*/{} {}-{} * * *", step, start, end);
        let cron = parse_cron_expression(&expression).unwrap();
        let next = cron.next_after(&after).unwrap();

        prop_assert!(next > after);
        prop_assert!(cron.matches(&next));
        prop_assert_eq!(next.minute() % step, 0);
        prop_assert!(next.hour() >= start && next.hour() <= end);
    });
}

/// **Property: Out-of-range values are rejected**
///
/// *For any* minute above 59, validation fails.
#[test]
fn property_out_of_range_minute_rejected() {
    proptest!(|(minute in 60u32..1000)| {
        let expression = format!("{} * * * *", minute);
        prop_assert!(validate_cron_expression(&expression).is_err());
    });
}

/// **Property: Wrong field counts are rejected**
#[test]
fn property_wrong_field_count_rejected() {
    proptest!(|(count in 1usize..10)| {
        prop_assume!(count != 5);
        let expression = vec!["*"; count].join(" ");
        prop_assert!(validate_cron_expression(&expression).is_err());
    });
}

/// **Property: Evaluation in a zone agrees with the local wall clock**
///
/// *For any* daily expression evaluated in Asia/Ho_Chi_Minh (no DST), the
/// result converted to local time has the requested hour and minute.
#[test]
fn property_timezone_wall_clock() {
    proptest!(|(
        minute in 0u32..60,
        hour in 0u32..24,
        after in reference_time(),
    )| {
        let tz = chrono_tz::Asia::Ho_Chi_Minh;
        let expression = format!("{} {} * * *", minute, hour);
        let next = next_fire_time(&expression, after, tz).unwrap();
        let local = next.with_timezone(&tz);
        prop_assert!(next > after);
        prop_assert_eq!(local.hour(), hour);
        prop_assert_eq!(local.minute(), minute);
    });
}

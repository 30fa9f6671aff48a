// Bandwidth policy resolution for remote sync

pub mod trigger;

pub use trigger::SyncTrigger;

use crate::policy::BandwidthPolicy;
use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transfer-rate cap handed to the sync driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "kbs")]
pub enum BandwidthLimit {
    Unlimited,
    /// KB/s; 0 means transfers are paused
    Limited(u64),
}

impl BandwidthLimit {
    pub fn is_paused(&self) -> bool {
        matches!(self, BandwidthLimit::Limited(0))
    }

    pub fn kbs(&self) -> Option<u64> {
        match self {
            BandwidthLimit::Unlimited => None,
            BandwidthLimit::Limited(kbs) => Some(*kbs),
        }
    }
}

impl fmt::Display for BandwidthLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandwidthLimit::Unlimited => f.write_str("unlimited"),
            BandwidthLimit::Limited(kbs) => write!(f, "{} KB/s", kbs),
        }
    }
}

/// Rate cap in force at `now`, judged in `now`'s own time zone
pub fn effective_limit<T: TimeZone>(now: &DateTime<T>, policy: &BandwidthPolicy) -> BandwidthLimit {
    if !policy.enabled {
        return BandwidthLimit::Unlimited;
    }

    if policy.weekend_unlimited && matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
        return BandwidthLimit::Unlimited;
    }

    let time_of_day = NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second())
        .unwrap_or(NaiveTime::MIN);

    if in_window(time_of_day, policy.peak_start, policy.peak_end) {
        BandwidthLimit::Limited(policy.peak_limit_kbs)
    } else {
        BandwidthLimit::Limited(policy.offpeak_limit_kbs)
    }
}

/// `[start, end)`; wraps past midnight when `start > end`
fn in_window(at: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        at >= start && at < end
    } else {
        at >= start || at < end
    }
}

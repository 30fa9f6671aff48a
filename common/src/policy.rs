// Operator-editable policies persisted as string key/value settings.
// Policies are read from the store every time they are needed.

use crate::errors::{StorageError, ValidationError};
use crate::schedule::validate_cron_expression;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A policy that round-trips through the settings table
pub trait SettingsRecord: Sized {
    /// Key prefix shared by every setting of this record
    const PREFIX: &'static str;

    fn to_settings(&self) -> Vec<(String, String)>;

    /// Build from stored values; missing keys fall back to defaults
    fn from_settings(values: &HashMap<String, String>) -> Result<Self, StorageError>;
}

fn key(prefix: &str, name: &str) -> String {
    format!("{}.{}", prefix, name)
}

fn read<T: FromStr>(
    values: &HashMap<String, String>,
    prefix: &str,
    name: &str,
    default: T,
) -> Result<T, StorageError>
where
    T::Err: fmt::Display,
{
    let full_key = key(prefix, name);
    match values.get(&full_key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| StorageError::InvalidValue {
            key: full_key,
            reason: e.to_string(),
        }),
    }
}

fn read_time(
    values: &HashMap<String, String>,
    prefix: &str,
    name: &str,
    default: NaiveTime,
) -> Result<NaiveTime, StorageError> {
    let full_key = key(prefix, name);
    match values.get(&full_key) {
        None => Ok(default),
        Some(raw) => parse_time_of_day(raw).map_err(|reason| StorageError::InvalidValue {
            key: full_key,
            reason,
        }),
    }
}

/// Parse `HH:MM` (or `HH:MM:SS`)
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, String> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| format!("'{}' is not a time of day (HH:MM)", raw))
}

fn format_time_of_day(time: &NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

// ============================================================================
// Retention
// ============================================================================

/// How many FULL/DIFF backup files survive cleanup, per database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub enabled: bool,
    pub keep_full_count: u32,
    pub keep_diff_per_full: u32,
    pub keep_orphan_diff: u32,
    /// Cron expression of the cleanup run
    pub schedule: String,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            keep_full_count: 2,
            keep_diff_per_full: 6,
            keep_orphan_diff: 0,
            schedule: "0 4 * * *".to_string(),
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_cron_expression(&self.schedule)?;
        Ok(())
    }
}

impl SettingsRecord for RetentionPolicy {
    const PREFIX: &'static str = "retention";

    fn to_settings(&self) -> Vec<(String, String)> {
        vec![
            (key(Self::PREFIX, "enabled"), self.enabled.to_string()),
            (
                key(Self::PREFIX, "keep_full_count"),
                self.keep_full_count.to_string(),
            ),
            (
                key(Self::PREFIX, "keep_diff_per_full"),
                self.keep_diff_per_full.to_string(),
            ),
            (
                key(Self::PREFIX, "keep_orphan_diff"),
                self.keep_orphan_diff.to_string(),
            ),
            (key(Self::PREFIX, "schedule"), self.schedule.clone()),
        ]
    }

    fn from_settings(values: &HashMap<String, String>) -> Result<Self, StorageError> {
        let defaults = Self::default();
        Ok(Self {
            enabled: read(values, Self::PREFIX, "enabled", defaults.enabled)?,
            keep_full_count: read(
                values,
                Self::PREFIX,
                "keep_full_count",
                defaults.keep_full_count,
            )?,
            keep_diff_per_full: read(
                values,
                Self::PREFIX,
                "keep_diff_per_full",
                defaults.keep_diff_per_full,
            )?,
            keep_orphan_diff: read(
                values,
                Self::PREFIX,
                "keep_orphan_diff",
                defaults.keep_orphan_diff,
            )?,
            schedule: read(values, Self::PREFIX, "schedule", defaults.schedule)?,
        })
    }
}

// ============================================================================
// Bandwidth
// ============================================================================

/// Time-of-day transfer cap for remote sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthPolicy {
    pub enabled: bool,
    /// Cap inside the peak window; 0 pauses transfers
    pub peak_limit_kbs: u64,
    pub offpeak_limit_kbs: u64,
    pub peak_start: NaiveTime,
    pub peak_end: NaiveTime,
    pub weekend_unlimited: bool,
}

impl Default for BandwidthPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            peak_limit_kbs: 1024,
            offpeak_limit_kbs: 10240,
            peak_start: hm(8, 0),
            peak_end: hm(20, 0),
            weekend_unlimited: true,
        }
    }
}

impl BandwidthPolicy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.peak_start == self.peak_end && self.enabled {
            return Err(ValidationError::InvalidFieldValue {
                field: "peak_end".to_string(),
                reason: "peak window must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

impl SettingsRecord for BandwidthPolicy {
    const PREFIX: &'static str = "bandwidth";

    fn to_settings(&self) -> Vec<(String, String)> {
        vec![
            (key(Self::PREFIX, "enabled"), self.enabled.to_string()),
            (
                key(Self::PREFIX, "peak_limit_kbs"),
                self.peak_limit_kbs.to_string(),
            ),
            (
                key(Self::PREFIX, "offpeak_limit_kbs"),
                self.offpeak_limit_kbs.to_string(),
            ),
            (
                key(Self::PREFIX, "peak_start"),
                format_time_of_day(&self.peak_start),
            ),
            (
                key(Self::PREFIX, "peak_end"),
                format_time_of_day(&self.peak_end),
            ),
            (
                key(Self::PREFIX, "weekend_unlimited"),
                self.weekend_unlimited.to_string(),
            ),
        ]
    }

    fn from_settings(values: &HashMap<String, String>) -> Result<Self, StorageError> {
        let defaults = Self::default();
        Ok(Self {
            enabled: read(values, Self::PREFIX, "enabled", defaults.enabled)?,
            peak_limit_kbs: read(values, Self::PREFIX, "peak_limit_kbs", defaults.peak_limit_kbs)?,
            offpeak_limit_kbs: read(
                values,
                Self::PREFIX,
                "offpeak_limit_kbs",
                defaults.offpeak_limit_kbs,
            )?,
            peak_start: read_time(values, Self::PREFIX, "peak_start", defaults.peak_start)?,
            peak_end: read_time(values, Self::PREFIX, "peak_end", defaults.peak_end)?,
            weekend_unlimited: read(
                values,
                Self::PREFIX,
                "weekend_unlimited",
                defaults.weekend_unlimited,
            )?,
        })
    }
}

// ============================================================================
// Sync trigger settings
// ============================================================================

/// When policy-driven syncs fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Fixed daily time
    Scheduled,
    /// Debounced after the last backup of a burst completes
    AfterBackups,
    /// Only on explicit request
    Manual,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncMode::Scheduled => "scheduled",
            SyncMode::AfterBackups => "after_backups",
            SyncMode::Manual => "manual",
        };
        f.write_str(s)
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SyncMode::Scheduled),
            "after_backups" => Ok(SyncMode::AfterBackups),
            "manual" => Ok(SyncMode::Manual),
            _ => Err(format!("Invalid sync mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    pub mode: SyncMode,
    /// Local time of day used in `scheduled` mode
    pub sync_time: NaiveTime,
    /// Quiet period after the last backup in `after_backups` mode
    pub buffer_minutes: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mode: SyncMode::Manual,
            sync_time: hm(3, 0),
            buffer_minutes: 30,
        }
    }
}

impl SyncSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.buffer_minutes > 24 * 60 {
            return Err(ValidationError::InvalidFieldValue {
                field: "buffer_minutes".to_string(),
                reason: "must be at most one day".to_string(),
            });
        }
        Ok(())
    }
}

impl SettingsRecord for SyncSettings {
    const PREFIX: &'static str = "sync";

    fn to_settings(&self) -> Vec<(String, String)> {
        vec![
            (key(Self::PREFIX, "mode"), self.mode.to_string()),
            (key(Self::PREFIX, "time"), format_time_of_day(&self.sync_time)),
            (
                key(Self::PREFIX, "buffer_minutes"),
                self.buffer_minutes.to_string(),
            ),
        ]
    }

    fn from_settings(values: &HashMap<String, String>) -> Result<Self, StorageError> {
        let defaults = Self::default();
        Ok(Self {
            mode: read(values, Self::PREFIX, "mode", defaults.mode)?,
            sync_time: read_time(values, Self::PREFIX, "time", defaults.sync_time)?,
            buffer_minutes: read(values, Self::PREFIX, "buffer_minutes", defaults.buffer_minutes)?,
        })
    }
}

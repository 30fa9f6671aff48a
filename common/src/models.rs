use crate::errors::{ExecutionError, ValidationError};
use crate::schedule::validate_cron_expression;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Job Models
// ============================================================================

/// JobKind selects the executor a job is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backup,
    Maintenance,
    Sync,
    Cleanup,
    Summary,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Backup,
        JobKind::Maintenance,
        JobKind::Sync,
        JobKind::Cleanup,
        JobKind::Summary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::Maintenance => "maintenance",
            JobKind::Sync => "sync",
            JobKind::Cleanup => "cleanup",
            JobKind::Summary => "summary",
        }
    }

    /// Kinds that operate on a single database and therefore need a resource key
    pub fn requires_resource(&self) -> bool {
        matches!(self, JobKind::Backup | JobKind::Maintenance)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidFieldValue {
                field: "kind".to_string(),
                reason: format!("unknown job kind '{}'", s),
            })
    }
}

/// ScheduledJob is a cron-driven job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub name: String,
    pub kind: JobKind,
    pub cron_expression: String,
    /// Database the job operates on; `None` for global jobs
    pub resource_key: Option<String>,
    pub enabled: bool,
    /// Kind-specific options, stored as JSON
    #[serde(default)]
    pub options: serde_json::Value,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Build a job from a creation request. The job is not validated here.
    pub fn from_new(new: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: new.name,
            kind: new.kind,
            cron_expression: new.cron_expression,
            resource_key: new.resource_key,
            enabled: new.enabled,
            options: new.options,
            next_fire_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, update: JobUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(cron) = update.cron_expression {
            self.cron_expression = cron;
        }
        if let Some(resource_key) = update.resource_key {
            self.resource_key = resource_key;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(options) = update.options {
            self.options = options;
        }
        self.updated_at = Utc::now();
    }

    /// Validate everything that must hold before the job may be armed
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField("name".to_string()));
        }

        validate_cron_expression(&self.cron_expression)?;

        if self.kind.requires_resource()
            && self
                .resource_key
                .as_deref()
                .map_or(true, |key| key.trim().is_empty())
        {
            return Err(ValidationError::MissingField("resource_key".to_string()));
        }

        match self.kind {
            JobKind::Backup => self.backup_options().map(|_| ()),
            JobKind::Maintenance => self.maintenance_options().map(|_| ()),
            JobKind::Sync | JobKind::Cleanup | JobKind::Summary => Ok(()),
        }
    }

    pub fn backup_options(&self) -> Result<BackupOptions, ValidationError> {
        Ok(serde_json::from_value(self.options_or_empty())?)
    }

    pub fn maintenance_options(&self) -> Result<MaintenanceOptions, ValidationError> {
        Ok(serde_json::from_value(self.options_or_empty())?)
    }

    /// Resource key for kinds that need one
    pub fn require_resource_key(&self) -> Result<&str, ExecutionError> {
        self.resource_key.as_deref().ok_or_else(|| {
            ExecutionError::InvalidJobDefinition(format!(
                "{} job {} has no resource key",
                self.kind, self.id
            ))
        })
    }

    fn options_or_empty(&self) -> serde_json::Value {
        match &self.options {
            serde_json::Value::Null => serde_json::json!({}),
            other => other.clone(),
        }
    }
}

/// Request to create a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub kind: JobKind,
    pub cron_expression: String,
    #[serde(default)]
    pub resource_key: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub options: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

/// Partial update of a job; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub resource_key: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub options: Option<serde_json::Value>,
}

// ============================================================================
// Job Options
// ============================================================================

/// BackupType of a database backup file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupType {
    Full,
    Diff,
    Log,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "FULL",
            BackupType::Diff => "DIFF",
            BackupType::Log => "LOG",
        }
    }

    /// File extension used on disk
    pub fn extension(&self) -> &'static str {
        match self {
            BackupType::Log => "trn",
            BackupType::Full | BackupType::Diff => "bak",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(BackupType::Full),
            "DIFF" => Ok(BackupType::Diff),
            "LOG" => Ok(BackupType::Log),
            other => Err(ValidationError::InvalidFieldValue {
                field: "backup_type".to_string(),
                reason: format!("unknown backup type '{}'", other),
            }),
        }
    }
}

// Stored options are written by hand, so accept any casing
impl<'de> Deserialize<'de> for BackupType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Options for backup jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupOptions {
    #[serde(default = "default_backup_type")]
    pub backup_type: BackupType,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default = "default_true")]
    pub checksum: bool,
}

fn default_backup_type() -> BackupType {
    BackupType::Full
}

fn default_true() -> bool {
    true
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            backup_type: BackupType::Full,
            compression: true,
            checksum: true,
        }
    }
}

/// MaintenanceTask performed by a maintenance job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    IntegrityCheck,
    IndexRebuild,
    IndexReorganize,
    UpdateStatistics,
}

impl fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MaintenanceTask::IntegrityCheck => "integrity_check",
            MaintenanceTask::IndexRebuild => "index_rebuild",
            MaintenanceTask::IndexReorganize => "index_reorganize",
            MaintenanceTask::UpdateStatistics => "update_statistics",
        };
        f.write_str(name)
    }
}

/// Options for maintenance jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceOptions {
    pub task: MaintenanceTask,
    /// Integrity check: only verify physical page structure
    #[serde(default)]
    pub physical_only: bool,
    /// Index rebuild: keep the table available while rebuilding
    #[serde(default)]
    pub online: bool,
}

// ============================================================================
// JobRun Models
// ============================================================================

/// RunStatus of a single execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "partial" => Ok(RunStatus::Partial),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// TriggerSource records why a run started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Cron timer fired
    Scheduled,
    /// Operator asked for an immediate run
    Manual,
    /// Debounced sync after a burst of backups
    AfterBackups,
    /// Fixed daily sync time
    SyncSchedule,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerSource::Scheduled => "scheduled",
            TriggerSource::Manual => "manual",
            TriggerSource::AfterBackups => "after_backups",
            TriggerSource::SyncSchedule => "sync_schedule",
        };
        f.write_str(s)
    }
}

impl FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TriggerSource::Scheduled),
            "manual" => Ok(TriggerSource::Manual),
            "after_backups" => Ok(TriggerSource::AfterBackups),
            "sync_schedule" => Ok(TriggerSource::SyncSchedule),
            _ => Err(format!("Invalid trigger source: {}", s)),
        }
    }
}

/// Quantitative results of a run, kept in history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_moved: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_deduplicated: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_affected: Option<u64>,
    /// Per-file failures of a cleanup batch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// JobRun is one concrete execution attempt of a ScheduledJob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub kind: JobKind,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub metrics: RunMetrics,
}

impl JobRun {
    /// Create a new running run for a job
    pub fn start(job_id: Uuid, kind: JobKind, trigger: TriggerSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            kind,
            trigger,
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            error_message: None,
            metrics: RunMetrics::default(),
        }
    }

    /// Move the run to a terminal state
    pub fn finish(&mut self, status: RunStatus, metrics: RunMetrics, error: Option<String>) {
        self.status = status;
        self.metrics = metrics;
        self.error_message = error;
        self.completed_at = Some(Utc::now());
    }
}

/// Result of asking the coordinator to execute a job
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The run happened and reached a terminal status
    Completed(JobRun),
    /// Another run of the same job was in progress; nothing was recorded
    Skipped { job_id: Uuid, reason: String },
}

impl ExecutionOutcome {
    pub fn run(&self) -> Option<&JobRun> {
        match self {
            ExecutionOutcome::Completed(run) => Some(run),
            ExecutionOutcome::Skipped { .. } => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ExecutionOutcome::Skipped { .. })
    }
}

// ============================================================================
// Backup files and summaries
// ============================================================================

/// BackupFile is one backup file found on disk
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupFile {
    pub path: std::path::PathBuf,
    pub database_id: String,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Per-kind counters in a daily summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindStats {
    pub runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub partial: u64,
}

/// A failed run as listed in the daily summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRunSummary {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub kind: JobKind,
    pub started_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// DailySummary aggregates the previous day's runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total_runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub partial: u64,
    pub still_running: u64,
    pub by_kind: BTreeMap<JobKind, KindStats>,
    pub bytes_backed_up: u64,
    pub failures: Vec<FailedRunSummary>,
}

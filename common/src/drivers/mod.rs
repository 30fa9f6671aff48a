// Boundaries to the database server and the remote archive, plus the
// command-line implementations used in production.

pub mod borg;
pub mod sqlcmd;

pub use borg::BorgSyncDriver;
pub use sqlcmd::SqlcmdDriver;

use crate::bandwidth::BandwidthLimit;
use crate::errors::ExecutionError;
use crate::models::{BackupOptions, MaintenanceOptions};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// A single database backup to perform
#[derive(Debug, Clone, PartialEq)]
pub struct BackupRequest {
    pub database_id: String,
    pub options: BackupOptions,
    /// File the server writes the backup to
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupOutcome {
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceOutcome {
    /// Server messages worth keeping in run history
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
    pub bytes_transferred: u64,
    pub bytes_deduplicated: u64,
    pub files: u64,
}

/// DatabaseDriver performs backups and maintenance against the database server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    async fn run_backup(&self, request: &BackupRequest) -> Result<BackupOutcome, ExecutionError>;

    async fn run_maintenance(
        &self,
        database_id: &str,
        options: &MaintenanceOptions,
    ) -> Result<MaintenanceOutcome, ExecutionError>;
}

/// SyncDriver pushes the local backup tree to remote storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncDriver: Send + Sync {
    async fn sync(&self, limit: BandwidthLimit) -> Result<SyncOutcome, ExecutionError>;
}

/// Captured output of an external command that exited successfully
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run an external command to completion, killing it on timeout
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    timeout: Duration,
) -> Result<CommandOutput, ExecutionError> {
    debug!(program, arg_count = args.len(), "Spawning command");

    let child = Command::new(program)
        .args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecutionError::CommandSpawnFailed {
            command: program.to_string(),
            reason: e.to_string(),
        })?;

    // On timeout the future is dropped, which kills the child
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ExecutionError::CommandSpawnFailed {
                command: program.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => {
            warn!(program, timeout_secs = timeout.as_secs(), "Command timed out");
            return Err(ExecutionError::Timeout(timeout.as_secs()));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(ExecutionError::CommandSpawnFailed {
            command: program.to_string(),
            reason: format!("exited with {}: {}", output.status, tail(&stderr, &stdout)),
        });
    }

    Ok(CommandOutput { stdout, stderr })
}

/// Last few lines of whichever stream has content
fn tail(stderr: &str, stdout: &str) -> String {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    let lines: Vec<&str> = source.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}

// Remote sync through a borg repository

use super::{run_command, SyncDriver, SyncOutcome};
use crate::bandwidth::BandwidthLimit;
use crate::config::SyncConfig;
use crate::errors::ExecutionError;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// BorgSyncDriver archives the backup tree with `borg create`
pub struct BorgSyncDriver {
    borg_path: String,
    repository: String,
    passphrase_env: Option<String>,
    source_paths: Vec<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CreateOutput {
    archive: ArchiveInfo,
}

#[derive(Debug, Deserialize)]
struct ArchiveInfo {
    stats: ArchiveStats,
}

#[derive(Debug, Deserialize)]
struct ArchiveStats {
    original_size: u64,
    deduplicated_size: u64,
    nfiles: u64,
}

impl BorgSyncDriver {
    /// `source_paths` default to the backup root when the config lists none
    pub fn new(config: &SyncConfig, backup_root: &str) -> Self {
        let source_paths = if config.source_paths.is_empty() {
            vec![backup_root.to_string()]
        } else {
            config.source_paths.clone()
        };
        Self {
            borg_path: config.borg_path.clone(),
            repository: config.repository.clone(),
            passphrase_env: config.passphrase_env.clone(),
            source_paths,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    fn create_args(&self, limit: BandwidthLimit, archive_name: &str) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--json".to_string(),
            "--stats".to_string(),
            "--compression".to_string(),
            "lz4".to_string(),
        ];
        if let Some(kbs) = limit.kbs() {
            // borg takes KiB/s
            args.push("--upload-ratelimit".to_string());
            args.push(kbs.to_string());
        }
        args.push(format!("{}::{}", self.repository, archive_name));
        args.extend(self.source_paths.iter().cloned());
        args
    }

    fn envs(&self) -> Result<Vec<(String, String)>, ExecutionError> {
        let mut envs = vec![("BORG_RELOCATED_REPO_ACCESS_IS_OK".to_string(), "no".to_string())];
        if let Some(name) = &self.passphrase_env {
            let passphrase = std::env::var(name).map_err(|_| {
                ExecutionError::SyncDriverFailed(format!(
                    "passphrase environment variable {} is not set",
                    name
                ))
            })?;
            envs.push(("BORG_PASSPHRASE".to_string(), passphrase));
        }
        Ok(envs)
    }
}

fn parse_create_output(stdout: &str) -> Result<SyncOutcome, ExecutionError> {
    let output: CreateOutput = serde_json::from_str(stdout).map_err(|e| {
        ExecutionError::SyncDriverFailed(format!("unreadable borg output: {}", e))
    })?;
    let stats = output.archive.stats;
    Ok(SyncOutcome {
        bytes_transferred: stats.deduplicated_size,
        bytes_deduplicated: stats.original_size.saturating_sub(stats.deduplicated_size),
        files: stats.nfiles,
    })
}

#[async_trait]
impl SyncDriver for BorgSyncDriver {
    #[instrument(skip(self), fields(repository = %self.repository))]
    async fn sync(&self, limit: BandwidthLimit) -> Result<SyncOutcome, ExecutionError> {
        let archive_name = format!("backups-{}", Utc::now().format("%Y%m%dT%H%M%S"));
        let args = self.create_args(limit, &archive_name);

        let output = run_command(&self.borg_path, &args, &self.envs()?, self.timeout)
            .await
            .map_err(|e| match e {
                ExecutionError::CommandSpawnFailed { reason, .. } => {
                    ExecutionError::SyncDriverFailed(reason)
                }
                other => other,
            })?;
        if !output.stderr.trim().is_empty() {
            debug!(stderr = %output.stderr.trim(), "borg diagnostics");
        }

        let outcome = parse_create_output(&output.stdout)?;
        info!(
            archive = %archive_name,
            bytes_transferred = outcome.bytes_transferred,
            files = outcome.files,
            limit = %limit,
            "Sync archive created"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        SyncConfig {
            borg_path: "borg".to_string(),
            repository: "ssh://backup@offsite/./repo".to_string(),
            passphrase_env: None,
            source_paths: Vec::new(),
            timeout_seconds: 3600,
        }
    }

    #[test]
    fn test_args_with_rate_limit() {
        let driver = BorgSyncDriver::new(&config(), "/var/backups");
        let args = driver.create_args(BandwidthLimit::Limited(512), "a1");
        assert!(args.windows(2).any(|w| w[0] == "--upload-ratelimit" && w[1] == "512"));
        assert_eq!(args[args.len() - 2], "ssh://backup@offsite/./repo::a1");
        assert_eq!(args[args.len() - 1], "/var/backups");
    }

    #[test]
    fn test_unlimited_omits_rate_limit() {
        let driver = BorgSyncDriver::new(&config(), "/var/backups");
        let args = driver.create_args(BandwidthLimit::Unlimited, "a1");
        assert!(!args.iter().any(|a| a == "--upload-ratelimit"));
    }

    #[test]
    fn test_parse_create_output() {
        let stdout = r#"{
            "archive": {
                "name": "a1",
                "stats": {
                    "compressed_size": 700,
                    "deduplicated_size": 300,
                    "nfiles": 4,
                    "original_size": 1000
                }
            },
            "repository": {"location": "/repo"}
        }"#;
        let outcome = parse_create_output(stdout).unwrap();
        assert_eq!(outcome.bytes_transferred, 300);
        assert_eq!(outcome.bytes_deduplicated, 700);
        assert_eq!(outcome.files, 4);
    }

    #[test]
    fn test_garbage_output_is_a_driver_error() {
        assert!(matches!(
            parse_create_output("not json"),
            Err(ExecutionError::SyncDriverFailed(_))
        ));
    }

    #[test]
    fn test_missing_passphrase_env() {
        let driver = BorgSyncDriver::new(
            &SyncConfig {
                passphrase_env: Some("BACKUP_ORCHESTRATOR_TEST_UNSET_PASSPHRASE".to_string()),
                ..config()
            },
            "/var/backups",
        );
        assert!(driver.envs().is_err());
    }
}

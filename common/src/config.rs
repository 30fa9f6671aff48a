// Daemon configuration, layered from TOML files and the environment

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Daemon settings, one section per concern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub backup: BackupConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA time zone cron expressions and policies are evaluated in
    pub timezone: String,
    /// How long shutdown waits for in-flight runs
    pub shutdown_grace_seconds: u64,
}

/// Local backup storage and the SQL Server connection used by `sqlcmd`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub root_dir: String,
    #[serde(default = "default_sqlcmd_path")]
    pub sqlcmd_path: String,
    pub server: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub command_timeout_seconds: u64,
}

fn default_sqlcmd_path() -> String {
    "sqlcmd".to_string()
}

/// Remote deduplicating archive used for off-site sync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_borg_path")]
    pub borg_path: String,
    pub repository: String,
    /// Name of the environment variable holding the repository passphrase
    #[serde(default)]
    pub passphrase_env: Option<String>,
    #[serde(default)]
    pub source_paths: Vec<String>,
    pub timeout_seconds: u64,
}

fn default_borg_path() -> String {
    "borg".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_secret: None,
            timeout_seconds: default_webhook_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Read `./config`, falling back to built-in values for anything unset
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Layers, lowest precedence first: `default.toml`, `local.toml`, then
    /// `APP__SECTION__KEY` environment variables
    pub fn load_from_path<P: AsRef<Path>>(dir: P) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        Config::builder()
            .add_source(File::from(dir.join("default.toml")).required(false))
            .add_source(File::from(dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Reject settings the daemon cannot start with
    pub fn validate(&self) -> Result<(), String> {
        let checks: [(bool, &str); 8] = [
            (self.database.url.is_empty(), "database.url is empty"),
            (self.database.max_connections == 0, "database.max_connections is 0"),
            (self.backup.root_dir.is_empty(), "backup.root_dir is empty"),
            (self.backup.server.is_empty(), "backup.server is empty"),
            (self.backup.command_timeout_seconds == 0, "backup.command_timeout_seconds is 0"),
            (self.sync.repository.is_empty(), "sync.repository is empty"),
            (self.sync.timeout_seconds == 0, "sync.timeout_seconds is 0"),
            (
                self.notification.webhook_secret.is_some()
                    && self.notification.webhook_url.is_none(),
                "notification.webhook_secret is set without webhook_url",
            ),
        ];
        if let Some((_, problem)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(problem.to_string());
        }

        crate::schedule::parse_timezone(&self.scheduler.timezone)
            .map(|_| ())
            .map_err(|_| {
                format!(
                    "scheduler.timezone '{}' is not a known IANA zone",
                    self.scheduler.timezone
                )
            })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/backup_orchestrator".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            scheduler: SchedulerConfig {
                timezone: "UTC".to_string(),
                shutdown_grace_seconds: 30,
            },
            backup: BackupConfig {
                root_dir: "/var/backups/mssql".to_string(),
                sqlcmd_path: default_sqlcmd_path(),
                server: "localhost".to_string(),
                username: None,
                password: None,
                command_timeout_seconds: 6 * 3600,
            },
            sync: SyncConfig {
                borg_path: default_borg_path(),
                repository: "ssh://backup@offsite/./mssql".to_string(),
                passphrase_env: Some("BORG_PASSPHRASE".to_string()),
                source_paths: vec!["/var/backups/mssql".to_string()],
                timeout_seconds: 12 * 3600,
            },
            notification: NotificationConfig::default(),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults_validate() {
        assert_eq!(Settings::default().validate(), Ok(()));
    }

    fn problem_after(edit: impl FnOnce(&mut Settings)) -> String {
        let mut settings = Settings::default();
        edit(&mut settings);
        settings.validate().unwrap_err()
    }

    #[test]
    fn test_each_broken_setting_is_named() {
        assert!(problem_after(|s| s.database.url.clear()).contains("database.url"));
        assert!(problem_after(|s| s.scheduler.timezone = "Nowhere/Special".to_string())
            .contains("scheduler.timezone"));
        assert!(problem_after(|s| s.backup.command_timeout_seconds = 0)
            .contains("backup.command_timeout_seconds"));
        assert!(problem_after(|s| s.sync.repository.clear()).contains("sync.repository"));
        assert!(
            problem_after(|s| s.notification.webhook_secret = Some("s3cret".to_string()))
                .contains("notification.webhook_secret")
        );
    }
}

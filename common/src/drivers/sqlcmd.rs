// SQL Server driver built on the `sqlcmd` command-line client

use super::{run_command, BackupOutcome, BackupRequest, DatabaseDriver, MaintenanceOutcome};
use crate::config::BackupConfig;
use crate::errors::ExecutionError;
use crate::models::{BackupType, MaintenanceOptions, MaintenanceTask};
use crate::store::backup_dir::is_valid_database_id;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument};

/// SqlcmdDriver runs T-SQL through `sqlcmd`
pub struct SqlcmdDriver {
    sqlcmd_path: String,
    server: String,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl SqlcmdDriver {
    pub fn new(config: &BackupConfig) -> Self {
        Self {
            sqlcmd_path: config.sqlcmd_path.clone(),
            server: config.server.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            timeout: Duration::from_secs(config.command_timeout_seconds),
        }
    }

    fn connection_args(&self) -> Vec<String> {
        let mut args = vec!["-S".to_string(), self.server.clone()];
        match &self.username {
            Some(user) => {
                args.push("-U".to_string());
                args.push(user.clone());
            }
            // Windows / Kerberos integrated auth
            None => args.push("-E".to_string()),
        }
        // Abort on error and allow quoted identifiers
        args.push("-b".to_string());
        args.push("-I".to_string());
        args
    }

    fn envs(&self) -> Vec<(String, String)> {
        self.password
            .as_ref()
            .map(|password| vec![("SQLCMDPASSWORD".to_string(), password.clone())])
            .unwrap_or_default()
    }

    async fn execute(&self, sql: &str) -> Result<String, ExecutionError> {
        let mut args = self.connection_args();
        args.push("-Q".to_string());
        args.push(sql.to_string());

        let output = run_command(&self.sqlcmd_path, &args, &self.envs(), self.timeout)
            .await
            .map_err(|e| match e {
                ExecutionError::CommandSpawnFailed { reason, .. } => {
                    ExecutionError::DatabaseDriverFailed(reason)
                }
                other => other,
            })?;
        Ok(output.stdout)
    }
}

fn check_database_id(database_id: &str) -> Result<(), ExecutionError> {
    if is_valid_database_id(database_id) {
        Ok(())
    } else {
        Err(ExecutionError::InvalidJobDefinition(format!(
            "'{}' is not a valid database id",
            database_id
        )))
    }
}

/// `[name]` with embedded brackets escaped
pub fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// `N'text'` with embedded quotes escaped
pub fn quote_literal(text: &str) -> String {
    format!("N'{}'", text.replace('\'', "''"))
}

/// T-SQL for a backup request
pub fn backup_statement(request: &BackupRequest) -> String {
    let database = quote_identifier(&request.database_id);
    let disk = quote_literal(&request.destination.to_string_lossy());

    let mut with = vec!["INIT".to_string()];
    if request.options.backup_type == BackupType::Diff {
        with.insert(0, "DIFFERENTIAL".to_string());
    }
    if request.options.compression {
        with.push("COMPRESSION".to_string());
    }
    if request.options.checksum {
        with.push("CHECKSUM".to_string());
    }
    with.push("STATS = 10".to_string());

    let verb = match request.options.backup_type {
        BackupType::Log => "BACKUP LOG",
        BackupType::Full | BackupType::Diff => "BACKUP DATABASE",
    };
    format!("{} {} TO DISK = {} WITH {}", verb, database, disk, with.join(", "))
}

/// T-SQL for a maintenance task
pub fn maintenance_statement(database_id: &str, options: &MaintenanceOptions) -> String {
    let database = quote_identifier(database_id);
    match options.task {
        MaintenanceTask::IntegrityCheck => {
            let mut sql = format!("DBCC CHECKDB ({}) WITH NO_INFOMSGS", database);
            if options.physical_only {
                sql.push_str(", PHYSICAL_ONLY");
            }
            sql
        }
        MaintenanceTask::IndexRebuild => {
            let online = if options.online { "ON" } else { "OFF" };
            format!(
                "USE {}; EXEC sp_MSforeachtable 'ALTER INDEX ALL ON ? REBUILD WITH (ONLINE = {})'",
                database, online
            )
        }
        MaintenanceTask::IndexReorganize => format!(
            "USE {}; EXEC sp_MSforeachtable 'ALTER INDEX ALL ON ? REORGANIZE'",
            database
        ),
        MaintenanceTask::UpdateStatistics => format!("USE {}; EXEC sp_updatestats", database),
    }
}

fn last_message(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
}

async fn file_size(path: &Path) -> u64 {
    // The server may write to a path this host cannot see
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

#[async_trait]
impl DatabaseDriver for SqlcmdDriver {
    #[instrument(
        skip(self, request),
        fields(
            database_id = %request.database_id,
            backup_type = %request.options.backup_type
        )
    )]
    async fn run_backup(&self, request: &BackupRequest) -> Result<BackupOutcome, ExecutionError> {
        check_database_id(&request.database_id)?;

        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ExecutionError::StorageFailed(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        self.execute(&backup_statement(request)).await?;

        let bytes_written = file_size(&request.destination).await;
        info!(bytes_written, destination = %request.destination.display(), "Backup written");
        Ok(BackupOutcome { bytes_written })
    }

    #[instrument(skip(self, options), fields(task = %options.task))]
    async fn run_maintenance(
        &self,
        database_id: &str,
        options: &MaintenanceOptions,
    ) -> Result<MaintenanceOutcome, ExecutionError> {
        check_database_id(database_id)?;
        let stdout = self
            .execute(&maintenance_statement(database_id, options))
            .await?;
        Ok(MaintenanceOutcome {
            summary: last_message(&stdout),
        })
    }
}

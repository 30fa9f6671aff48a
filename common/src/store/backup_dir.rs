// Local backup directory layout:
//   <root>/<database>/<database>_<FULL|DIFF|LOG>_<YYYYMMDD_HHMMSS>.<bak|trn>
// Files that do not follow the naming scheme are ignored, which also keeps
// them out of reach of the retention planner.

use crate::errors::StorageError;
use crate::models::{BackupFile, BackupType};
use chrono::{DateTime, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

lazy_static! {
    static ref BACKUP_FILE_NAME: Regex =
        Regex::new(r"^(?P<db>.+)_(?P<kind>FULL|DIFF|LOG)_(?P<ts>\d{8}_\d{6})\.(?:bak|trn)$")
            .expect("Invalid regex pattern");
    static ref DATABASE_ID: Regex =
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,127}$").expect("Invalid regex pattern");
}

/// Check that a database id is safe to use as a directory name and in T-SQL
pub fn is_valid_database_id(database_id: &str) -> bool {
    DATABASE_ID.is_match(database_id) && !database_id.contains("..")
}

/// Parsed components of a backup file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFileName {
    pub database_id: String,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
}

/// Parse a backup file name; `None` for files that are not ours
pub fn parse_backup_file_name(name: &str) -> Option<BackupFileName> {
    let captures = BACKUP_FILE_NAME.captures(name)?;
    let backup_type = captures.name("kind")?.as_str().parse().ok()?;
    let created_at = NaiveDateTime::parse_from_str(captures.name("ts")?.as_str(), TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    Some(BackupFileName {
        database_id: captures.name("db")?.as_str().to_string(),
        backup_type,
        created_at,
    })
}

/// BackupDirectory lists and names backup files under a root directory
#[derive(Debug, Clone)]
pub struct BackupDirectory {
    root: PathBuf,
}

impl BackupDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database_dir(&self, database_id: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_database_id(database_id) {
            return Err(StorageError::InvalidValue {
                key: "database_id".to_string(),
                reason: format!("'{}' is not a valid database id", database_id),
            });
        }
        Ok(self.root.join(database_id))
    }

    /// Path a new backup should be written to
    pub fn backup_path(
        &self,
        database_id: &str,
        backup_type: BackupType,
        at: DateTime<Utc>,
    ) -> Result<PathBuf, StorageError> {
        let file_name = format!(
            "{}_{}_{}.{}",
            database_id,
            backup_type,
            at.format(TIMESTAMP_FORMAT),
            backup_type.extension()
        );
        Ok(self.database_dir(database_id)?.join(file_name))
    }

    /// Backup files of one database; a missing directory is an empty listing
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn list(&self, database_id: &str) -> Result<Vec<BackupFile>, StorageError> {
        let dir = self.database_dir(database_id)?;

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "Backup directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(parsed) = parse_backup_file_name(name) else {
                debug!(file = name, "Skipping file outside the backup naming scheme");
                continue;
            };
            if parsed.database_id != database_id {
                warn!(
                    file = name,
                    expected = database_id,
                    "Backup file belongs to another database, skipping"
                );
                continue;
            }

            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            files.push(BackupFile {
                path: entry.path(),
                database_id: parsed.database_id,
                backup_type: parsed.backup_type,
                created_at: parsed.created_at,
                size_bytes: metadata.len(),
            });
        }

        files.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.path.cmp(&b.path)));
        debug!(count = files.len(), "Listed backup files");
        Ok(files)
    }

    /// Names of database directories under the root
    pub async fn list_databases(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut databases = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_valid_database_id(name) {
                    databases.push(name.to_string());
                }
            }
        }
        databases.sort();
        Ok(databases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_backup_file_name() {
        let parsed = parse_backup_file_name("sales_db_FULL_20240301_020000.bak").unwrap();
        assert_eq!(parsed.database_id, "sales_db");
        assert_eq!(parsed.backup_type, BackupType::Full);
        assert_eq!(
            parsed.created_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap()
        );

        let log = parse_backup_file_name("hr_LOG_20240301_021500.trn").unwrap();
        assert_eq!(log.backup_type, BackupType::Log);
    }

    #[test]
    fn test_foreign_files_are_not_parsed() {
        assert!(parse_backup_file_name("notes.txt").is_none());
        assert!(parse_backup_file_name("sales_FULL_2024.bak").is_none());
        assert!(parse_backup_file_name("sales_FULL_20241301_020000.bak").is_none());
    }

    #[test]
    fn test_database_id_validation() {
        assert!(is_valid_database_id("Sales_2024"));
        assert!(!is_valid_database_id("../etc"));
        assert!(!is_valid_database_id("a]; DROP DATABASE x"));
        assert!(!is_valid_database_id(""));
    }

    #[test]
    fn test_backup_path_round_trips_through_parser() {
        let dir = BackupDirectory::new("/var/backups");
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let path = dir.backup_path("sales", BackupType::Diff, at).unwrap();
        assert_eq!(
            path,
            PathBuf::from("/var/backups/sales/sales_DIFF_20240506_070809.bak")
        );
        let parsed =
            parse_backup_file_name(path.file_name().unwrap().to_str().unwrap()).unwrap();
        assert_eq!(parsed.created_at, at);
    }

    #[tokio::test]
    async fn test_list_reads_sizes_and_skips_foreign_files() {
        let temp = tempfile::TempDir::new().unwrap();
        let db_dir = temp.path().join("sales");
        std::fs::create_dir_all(&db_dir).unwrap();
        std::fs::write(db_dir.join("sales_FULL_20240301_020000.bak"), vec![0u8; 10]).unwrap();
        std::fs::write(db_dir.join("sales_DIFF_20240302_020000.bak"), vec![0u8; 4]).unwrap();
        std::fs::write(db_dir.join("readme.txt"), b"hi").unwrap();

        let dir = BackupDirectory::new(temp.path());
        let files = dir.list("sales").await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].backup_type, BackupType::Full);
        assert_eq!(files[0].size_bytes, 10);
        assert_eq!(files[1].size_bytes, 4);

        assert_eq!(dir.list_databases().await.unwrap(), vec!["sales".to_string()]);
        assert!(dir.list("missing").await.unwrap().is_empty());
    }
}

// Retention planner
//
// Decides which backup files of a database survive cleanup. The planner is
// pure: it only looks at the listing it is given. Deleting is the cleanup
// executor's job.
//
// Chain rules:
// - FULL backups are ranked newest first; the first `keep_full_count` stay.
// - A DIFF belongs to the newest FULL created at or before it.
// - A retained FULL keeps its newest `keep_diff_per_full` DIFFs.
// - An evicted FULL takes its whole chain with it.
// - DIFFs older than every FULL on disk are orphans; the newest
//   `keep_orphan_diff` of them stay.
// - LOG backups are never planned for deletion.

use crate::models::{BackupFile, BackupType};
use crate::policy::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Files to keep and files to delete, both oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPlan {
    pub keep: Vec<BackupFile>,
    pub delete: Vec<BackupFile>,
}

impl RetentionPlan {
    pub fn delete_size_bytes(&self) -> u64 {
        self.delete.iter().map(|file| file.size_bytes).sum()
    }

    pub fn delete_size_mb(&self) -> f64 {
        bytes_to_mb(self.delete_size_bytes())
    }
}

/// Dry-run report for one database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPreview {
    pub database_id: String,
    pub policy: RetentionPolicy,
    pub keep: Vec<BackupFile>,
    pub delete: Vec<BackupFile>,
    pub delete_size_bytes: u64,
    pub delete_size_mb: f64,
}

impl RetentionPreview {
    pub fn new(
        database_id: impl Into<String>,
        policy: RetentionPolicy,
        plan: RetentionPlan,
    ) -> Self {
        let delete_size_bytes = plan.delete_size_bytes();
        Self {
            database_id: database_id.into(),
            policy,
            keep: plan.keep,
            delete: plan.delete,
            delete_size_bytes,
            delete_size_mb: bytes_to_mb(delete_size_bytes),
        }
    }
}

/// Megabytes rounded to two decimals
pub fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
}

/// Oldest first; ties broken by path so the order is total
fn by_age(a: &BackupFile, b: &BackupFile) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.path.cmp(&b.path))
}

/// Plan retention over a file listing.
///
/// Files of several databases may be mixed; each database is planned on its own.
pub fn plan(files: &[BackupFile], policy: &RetentionPolicy) -> RetentionPlan {
    let mut by_database: BTreeMap<&str, Vec<&BackupFile>> = BTreeMap::new();
    for file in files {
        by_database
            .entry(file.database_id.as_str())
            .or_default()
            .push(file);
    }

    let mut result = RetentionPlan::default();
    for database_files in by_database.values() {
        plan_database(database_files, policy, &mut result);
    }

    result.keep.sort_by(by_age);
    result.delete.sort_by(by_age);
    result
}

fn plan_database(files: &[&BackupFile], policy: &RetentionPolicy, out: &mut RetentionPlan) {
    let mut fulls: Vec<&BackupFile> = Vec::new();
    let mut diffs: Vec<&BackupFile> = Vec::new();
    for file in files.iter().copied() {
        match file.backup_type {
            BackupType::Full => fulls.push(file),
            BackupType::Diff => diffs.push(file),
            BackupType::Log => out.keep.push(file.clone()),
        }
    }

    // Newest first
    fulls.sort_by(|a, b| by_age(b, a));
    let keep_full = (policy.keep_full_count as usize).min(fulls.len());

    // One chain per FULL, same index as `fulls`
    let mut chains: Vec<Vec<&BackupFile>> = vec![Vec::new(); fulls.len()];
    let mut orphans: Vec<&BackupFile> = Vec::new();

    for diff in diffs {
        let owner = fulls
            .iter()
            .position(|full| full.created_at <= diff.created_at);
        match owner {
            Some(index) => chains[index].push(diff),
            None => orphans.push(diff),
        }
    }

    for (index, (full, mut chain)) in fulls.iter().zip(chains).enumerate() {
        if index < keep_full {
            out.keep.push((*full).clone());
            chain.sort_by(|a, b| by_age(b, a));
            let keep_diff = (policy.keep_diff_per_full as usize).min(chain.len());
            let (kept, evicted) = chain.split_at(keep_diff);
            out.keep.extend(kept.iter().map(|file| (*file).clone()));
            out.delete.extend(evicted.iter().map(|file| (*file).clone()));
        } else {
            out.delete.push((*full).clone());
            out.delete.extend(chain.iter().map(|file| (*file).clone()));
        }
    }

    // Oldest orphans go first
    orphans.sort_by(|a, b| by_age(a, b));
    let evict = orphans
        .len()
        .saturating_sub(policy.keep_orphan_diff as usize);
    let (evicted, kept) = orphans.split_at(evict);
    out.delete.extend(evicted.iter().map(|file| (*file).clone()));
    out.keep.extend(kept.iter().map(|file| (*file).clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::path::PathBuf;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn file(name: &str, backup_type: BackupType, created_at: DateTime<Utc>) -> BackupFile {
        BackupFile {
            path: PathBuf::from(format!("/backups/sales/{}", name)),
            database_id: "sales".to_string(),
            backup_type,
            created_at,
            size_bytes: 1024,
        }
    }

    fn policy(full: u32, diff: u32, orphan: u32) -> RetentionPolicy {
        RetentionPolicy {
            enabled: true,
            keep_full_count: full,
            keep_diff_per_full: diff,
            keep_orphan_diff: orphan,
            ..Default::default()
        }
    }

    fn names(files: &[BackupFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    /// F1..F5 one week apart, each followed by two DIFFs
    fn five_generations() -> Vec<BackupFile> {
        let mut files = Vec::new();
        for generation in 0..5 {
            let base = generation * 7;
            files.push(file(&format!("F{}", generation + 1), BackupType::Full, day(base)));
            files.push(file(&format!("D{}a", generation + 1), BackupType::Diff, day(base + 1)));
            files.push(file(&format!("D{}b", generation + 1), BackupType::Diff, day(base + 2)));
        }
        files
    }

    #[test]
    fn test_keeps_newest_fulls_and_their_chains() {
        let result = plan(&five_generations(), &policy(2, 1, 0));

        assert_eq!(names(&result.keep), vec!["F4", "D4b", "F5", "D5b"]);
        assert_eq!(
            names(&result.delete),
            vec!["F1", "D1a", "D1b", "F2", "D2a", "D2b", "F3", "D3a", "D3b", "D4a", "D5a"]
        );
    }

    #[test]
    fn test_keep_all_diffs_when_allowance_is_large() {
        let result = plan(&five_generations(), &policy(2, 10, 0));
        assert_eq!(
            names(&result.keep),
            vec!["F4", "D4a", "D4b", "F5", "D5a", "D5b"]
        );
    }

    #[test]
    fn test_zero_fulls_deletes_everything_chained() {
        let result = plan(&five_generations(), &policy(0, 10, 10));
        assert!(result.keep.is_empty());
        assert_eq!(result.delete.len(), 15);
    }

    #[test]
    fn test_orphans_keep_newest_evict_oldest() {
        let files = vec![
            file("O1", BackupType::Diff, day(0)),
            file("O2", BackupType::Diff, day(1)),
            file("O3", BackupType::Diff, day(2)),
            file("F1", BackupType::Full, day(3)),
        ];
        let result = plan(&files, &policy(1, 0, 2));
        assert_eq!(names(&result.keep), vec!["O2", "O3", "F1"]);
        assert_eq!(names(&result.delete), vec!["O1"]);
    }

    #[test]
    fn test_logs_are_never_deleted() {
        let files = vec![
            file("F1", BackupType::Full, day(0)),
            file("L1", BackupType::Log, day(0)),
            file("F2", BackupType::Full, day(1)),
        ];
        let result = plan(&files, &policy(1, 0, 0));
        assert_eq!(names(&result.keep), vec!["L1", "F2"]);
        assert_eq!(names(&result.delete), vec!["F1"]);
    }

    #[test]
    fn test_databases_are_planned_independently() {
        let mut other = file("F9", BackupType::Full, day(0));
        other.database_id = "hr".to_string();
        other.path = PathBuf::from("/backups/hr/F9");
        let mut files = five_generations();
        files.push(other);

        let result = plan(&files, &policy(1, 0, 0));
        assert!(names(&result.keep).contains(&"F9".to_string()));
        assert!(names(&result.keep).contains(&"F5".to_string()));
    }

    #[test]
    fn test_plan_is_idempotent() {
        let files = five_generations();
        let policy = policy(3, 1, 1);
        assert_eq!(plan(&files, &policy), plan(&files, &policy));
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let files = five_generations();
        let mut reversed = files.clone();
        reversed.reverse();
        let policy = policy(2, 1, 0);
        assert_eq!(plan(&files, &policy), plan(&reversed, &policy));
    }

    #[test]
    fn test_delete_size() {
        let mut files = vec![
            file("F1", BackupType::Full, day(0)),
            file("F2", BackupType::Full, day(1)),
            file("F3", BackupType::Full, day(2)),
        ];
        files[0].size_bytes = 100 * 1024 * 1024;
        files[1].size_bytes = 150 * 1024 * 1024;
        files[2].size_bytes = 200 * 1024 * 1024;

        let result = plan(&files, &policy(2, 0, 0));
        assert_eq!(names(&result.delete), vec!["F1"]);
        assert_eq!(result.delete_size_mb(), 100.0);
    }

    #[test]
    fn test_bytes_to_mb_rounds() {
        assert_eq!(bytes_to_mb(1_572_864), 1.5);
        assert_eq!(bytes_to_mb(0), 0.0);
    }
}

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use reflection_sync_core::{parse_artifact_file_name, BackupType, CleanupReport, SyncError};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::SqliteRecordStore;

/// Age-based deletion of snapshot artifacts, one backup class at a time.
#[derive(Debug, Clone)]
pub struct RetentionManager {
    backup_root: PathBuf,
}

impl RetentionManager {
    #[must_use]
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
        }
    }

    /// Deletes snapshots of `backup_type` created more than `max_age_days`
    /// ago. Age comes from the metadata row when one exists, otherwise from
    /// the timestamp embedded in the file name. Files whose age cannot be
    /// established are reported and left in place.
    pub fn cleanup(
        &self,
        store: &SqliteRecordStore,
        backup_type: &BackupType,
        max_age_days: u32,
    ) -> Result<CleanupReport, SyncError> {
        if max_age_days == 0 {
            return Err(SyncError::Validation("max_age_days MUST be >= 1".to_string()));
        }
        let cutoff = store.clock().now() - Duration::days(i64::from(max_age_days));
        let mut report = CleanupReport::new(backup_type.clone(), max_age_days);
        let mut known = BTreeSet::new();

        for snapshot in store.list_snapshots(Some(backup_type))? {
            if let Some(name) = snapshot.artifact_path.file_name() {
                known.insert(name.to_os_string());
            }
            if snapshot.created_at >= cutoff {
                continue;
            }
            if snapshot.artifact_path.exists() {
                if !remove_artifact(&snapshot.artifact_path, &mut report) {
                    continue;
                }
            } else {
                report.missing_artifacts += 1;
            }
            store.delete_snapshot(snapshot.snapshot_id)?;
        }

        let dir = self.backup_root.join(backup_type.as_str());
        if dir.is_dir() {
            sweep_untracked(&dir, backup_type, cutoff, &known, &mut report);
        }

        for message in &report.warnings {
            warn!(backup_type = %backup_type, "{message}");
        }
        info!(
            backup_type = %backup_type,
            max_age_days,
            deleted = report.deleted_count,
            bytes_freed = report.bytes_freed,
            missing_artifacts = report.missing_artifacts,
            warnings = report.warnings.len(),
            errors = report.errors.len(),
            "retention cleanup finished"
        );
        Ok(report)
    }
}

/// Ages files that have no metadata row by the timestamp in their name.
fn sweep_untracked(
    dir: &Path,
    backup_type: &BackupType,
    cutoff: OffsetDateTime,
    known: &BTreeSet<OsString>,
    report: &mut CleanupReport,
) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            report
                .errors
                .push(format!("failed to list {}: {err}", dir.display()));
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                report
                    .errors
                    .push(format!("failed to read entry in {}: {err}", dir.display()));
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() || known.contains(&entry.file_name()) {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".tmp") {
            report.warnings.push(format!(
                "skipped leftover temp file {}",
                path.display()
            ));
            continue;
        }

        let parsed = parse_artifact_file_name(&name)
            .filter(|parsed| &parsed.backup_type == backup_type);
        let Some(parsed) = parsed else {
            report.warnings.push(format!(
                "skipped {}: cannot determine snapshot age from file name",
                path.display()
            ));
            continue;
        };

        if parsed.created_at < cutoff {
            remove_artifact(&path, report);
        }
    }
}

fn remove_artifact(path: &Path, report: &mut CleanupReport) -> bool {
    let size = match fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(err) => {
            report.warnings.push(format!(
                "cannot stat {}: {err}; bytes_freed excludes it",
                path.display()
            ));
            0
        }
    };
    match fs::remove_file(path) {
        Ok(()) => {
            report.deleted_count += 1;
            report.bytes_freed += size;
            report.deleted.push(path.to_path_buf());
            true
        }
        Err(err) => {
            report
                .errors
                .push(format!("failed to delete {}: {err}", path.display()));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use reflection_sync_core::{artifact_file_name, DateRange, TimeSegment};
    use ulid::Ulid;

    use super::*;
    use crate::test_support::*;
    use crate::SnapshotManager;

    #[test]
    fn expired_snapshots_are_deleted_and_fresh_ones_kept() {
        let clock = fixture_clock();
        let mut store = fixture_store(&clock);
        must(store.upsert(key("2025-07-05", TimeSegment::Morning), focus(7)));
        let root = temp_dir("reflect-retention");
        let snapshots = SnapshotManager::new(&root);
        let day = DateRange::single(date("2025-07-05"));

        let old = must(snapshots.create_snapshot(&store, &BackupType::Daily, day));
        clock.advance(Duration::days(6));
        let recent = must(snapshots.create_snapshot(&store, &BackupType::Daily, day));
        let weekly = must(snapshots.create_snapshot(&store, &BackupType::Weekly, day));
        clock.advance(Duration::days(2));

        let report = must(RetentionManager::new(&root).cleanup(&store, &BackupType::Daily, 7));
        assert_eq!(report.deleted_count, 1);
        assert_eq!(report.deleted, vec![old.artifact_path.clone()]);
        assert_eq!(report.bytes_freed, old.file_size);
        assert!(report.warnings.is_empty());
        assert!(!old.artifact_path.exists());
        assert!(recent.artifact_path.exists());
        assert!(weekly.artifact_path.exists());

        let remaining: Vec<Ulid> = must(store.list_snapshots(None))
            .into_iter()
            .map(|snapshot| snapshot.snapshot_id)
            .collect();
        assert!(!remaining.contains(&old.snapshot_id));
        assert_eq!(remaining.len(), 2);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn unparseable_and_temp_files_are_warned_about_not_deleted() {
        let clock = fixture_clock();
        let store = fixture_store(&clock);
        let root = temp_dir("reflect-retention-warn");
        let dir = root.join("daily");
        must(fs::create_dir_all(&dir));
        let stray = dir.join("3part_daily_backup_2024-01-01.json");
        let temp = dir.join("leftover.json.tmp");
        must(fs::write(&stray, b"{}"));
        must(fs::write(&temp, b"{"));

        clock.advance(Duration::days(400));
        let report = must(RetentionManager::new(&root).cleanup(&store, &BackupType::Daily, 1));
        assert_eq!(report.deleted_count, 0);
        assert_eq!(report.warnings.len(), 2);
        assert!(stray.exists());
        assert!(temp.exists());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn untracked_artifacts_are_aged_by_file_name() {
        let clock = fixture_clock();
        let store = fixture_store(&clock);
        let root = temp_dir("reflect-retention-orphan");
        let dir = root.join("monthly");
        must(fs::create_dir_all(&dir));

        let old_name = must(artifact_file_name(
            &BackupType::Monthly,
            "2024-01-01_2024-01-31",
            must(reflection_sync_core::parse_rfc3339_utc("2024-02-01T00:00:00Z")),
            Ulid::new(),
        ));
        let new_name = must(artifact_file_name(
            &BackupType::Monthly,
            "2025-06-01_2025-06-30",
            must(reflection_sync_core::parse_rfc3339_utc("2025-07-01T00:00:00Z")),
            Ulid::new(),
        ));
        must(fs::write(dir.join(&old_name), b"[]"));
        must(fs::write(dir.join(&new_name), b"[]"));

        let report = must(RetentionManager::new(&root).cleanup(&store, &BackupType::Monthly, 365));
        assert_eq!(report.deleted, vec![dir.join(&old_name)]);
        assert_eq!(report.bytes_freed, 2);
        assert!(dir.join(&new_name).exists());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn expired_rows_without_artifacts_count_as_missing() {
        let clock = fixture_clock();
        let store = fixture_store(&clock);
        let root = temp_dir("reflect-retention-missing");
        let snapshots = SnapshotManager::new(&root);
        let snapshot = must(snapshots.create_snapshot(
            &store,
            &BackupType::Weekly,
            DateRange::single(date("2025-07-05")),
        ));
        must(fs::remove_file(&snapshot.artifact_path));

        clock.advance(Duration::days(31));
        let report = must(RetentionManager::new(&root).cleanup(&store, &BackupType::Weekly, 30));
        assert_eq!(report.missing_artifacts, 1);
        assert_eq!(report.deleted_count, 0);
        assert!(must(store.list_snapshots(None)).is_empty());

        let _ = fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn unstattable_artifact_is_deleted_with_a_warning() {
        let root = temp_dir("reflect-retention-stat");
        let link = root.join("dangling.json");
        must(std::os::unix::fs::symlink(root.join("gone.json"), &link));

        let mut report = CleanupReport::new(BackupType::Daily, 7);
        assert!(remove_artifact(&link, &mut report));
        assert_eq!(report.deleted_count, 1);
        assert_eq!(report.bytes_freed, 0);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("bytes_freed excludes it"));
        assert!(fs::symlink_metadata(&link).is_err());

        let _ = fs::remove_dir_all(&root);
    }
}

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use reflection_sync_core::{
    artifact_file_name, canonical_json_bytes, hash_bytes, BackupType, DateRange, ExternalRecord,
    Record, Snapshot, SnapshotArtifact, SnapshotHeader, SyncError, SyncResult, VerificationIssue,
    VerificationReport, ARTIFACT_FORMAT_VERSION,
};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value;
use tracing::{info, warn};
use ulid::Ulid;

use crate::reconcile::ACTION_RESTORE;
use crate::SqliteRecordStore;

/// Writes, verifies and replays snapshot artifacts under one backup root.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    backup_root: PathBuf,
}

impl SnapshotManager {
    #[must_use]
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
        }
    }

    #[must_use]
    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Exports every record in `range` into a new artifact and records its
    /// metadata. The artifact is published with a rename, so a failed call
    /// leaves neither a partial file nor a metadata row behind.
    pub fn create_snapshot(
        &self,
        store: &SqliteRecordStore,
        backup_type: &BackupType,
        range: DateRange,
    ) -> Result<Snapshot, SyncError> {
        let records = store.get_range(range)?;
        let records_value = serde_json::to_value(&records)
            .map_err(|err| SyncError::Serialization(format!("failed to serialize records: {err}")))?;
        let records_bytes = canonical_json_bytes(&records_value)?;
        let content_hash = hash_bytes(&records_bytes);

        let snapshot_id = Ulid::new();
        let created_at = store.clock().now();
        let range_label = range.label();

        let header = SnapshotHeader {
            format_version: ARTIFACT_FORMAT_VERSION.to_string(),
            snapshot_id,
            backup_type: backup_type.clone(),
            range_label: range_label.clone(),
            date_from: range.from,
            date_to: range.to,
            record_count: records.len(),
            created_at,
            content_hash: content_hash.clone(),
        };
        let payload = artifact_payload(&header, &records_bytes)?;

        let dir = self.backup_root.join(backup_type.as_str());
        fs::create_dir_all(&dir).map_err(|err| {
            SyncError::SnapshotWrite(format!("failed to create {}: {err}", dir.display()))
        })?;
        let path = dir.join(artifact_file_name(
            backup_type,
            &range_label,
            created_at,
            snapshot_id,
        )?);
        publish_atomically(&path, &payload)?;

        let file_size = fs::metadata(&path)
            .map_err(|err| {
                SyncError::SnapshotWrite(format!("failed to stat {}: {err}", path.display()))
            })?
            .len();

        let snapshot = Snapshot {
            snapshot_id,
            backup_type: backup_type.clone(),
            date_from: range.from,
            date_to: range.to,
            range_label,
            artifact_path: path,
            record_count: records.len(),
            file_size,
            content_hash,
            created_at,
        };

        if let Err(err) = store.insert_snapshot(&snapshot) {
            let _ = fs::remove_file(&snapshot.artifact_path);
            return Err(err);
        }

        info!(
            snapshot_id = %snapshot.snapshot_id,
            backup_type = %snapshot.backup_type,
            range = %snapshot.range_label,
            records = snapshot.record_count,
            bytes = snapshot.file_size,
            "snapshot created"
        );
        Ok(snapshot)
    }

    /// Re-reads the artifact and compares it with the stored metadata.
    /// Integrity problems are reported as issues, never as errors.
    #[must_use]
    pub fn verify_snapshot(&self, snapshot: &Snapshot) -> VerificationReport {
        let mut report = VerificationReport::pending(snapshot);
        check_artifact(snapshot, &mut report);
        report.finish();

        if !report.verified {
            let codes: Vec<&str> = report.issues.iter().map(|issue| issue.code.as_str()).collect();
            warn!(snapshot_id = %snapshot.snapshot_id, issues = ?codes, "snapshot failed verification");
        }
        report
    }

    /// Parses the artifact without checking it against metadata.
    pub fn load_artifact(&self, snapshot: &Snapshot) -> Result<SnapshotArtifact, SyncError> {
        let bytes = fs::read(&snapshot.artifact_path).map_err(|err| {
            SyncError::NotFound(format!(
                "artifact {}: {err}",
                snapshot.artifact_path.display()
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|err| {
            SyncError::Serialization(format!(
                "artifact {} is not parseable: {err}",
                snapshot.artifact_path.display()
            ))
        })
    }

    /// Replays a verified snapshot into `target` through the reconciler, so
    /// restoring the same snapshot twice leaves the second run unchanged.
    pub fn restore_into_store(
        &self,
        snapshot: &Snapshot,
        target: &mut SqliteRecordStore,
    ) -> Result<SyncResult, SyncError> {
        let report = self.verify_snapshot(snapshot);
        if !report.verified {
            let codes: Vec<&str> = report.issues.iter().map(|issue| issue.code.as_str()).collect();
            return Err(SyncError::Validation(format!(
                "snapshot {} failed verification ({}); refusing to restore",
                snapshot.snapshot_id,
                codes.join(", ")
            )));
        }

        let artifact = self.load_artifact(snapshot)?;
        let incoming = artifact
            .records
            .iter()
            .map(|record| to_external(snapshot.snapshot_id, record))
            .collect::<Result<Vec<_>, _>>()?;

        target.reconcile(
            &format!("snapshot:{}", snapshot.snapshot_id),
            ACTION_RESTORE,
            &incoming,
        )
    }
}

/// Serializes the artifact with the `records` section emitted verbatim, so the
/// stored hash covers the exact bytes on disk.
fn artifact_payload(header: &SnapshotHeader, records: &[u8]) -> Result<Vec<u8>, SyncError> {
    let header = serde_json::to_vec(header)
        .map_err(|err| SyncError::Serialization(format!("failed to serialize header: {err}")))?;
    let mut payload = Vec::with_capacity(header.len() + records.len() + 24);
    payload.extend_from_slice(b"{\"header\":");
    payload.extend_from_slice(&header);
    payload.extend_from_slice(b",\"records\":");
    payload.extend_from_slice(records);
    payload.extend_from_slice(b"}\n");
    Ok(payload)
}

fn publish_atomically(path: &Path, payload: &[u8]) -> Result<(), SyncError> {
    let tmp = path.with_extension("json.tmp");
    write_then_rename(&tmp, path, payload).map_err(|err| {
        let _ = fs::remove_file(&tmp);
        SyncError::SnapshotWrite(format!("failed to publish {}: {err}", path.display()))
    })
}

fn write_then_rename(tmp: &Path, path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp)?;
    file.write_all(payload)?;
    file.flush()?;
    file.sync_all()?;
    fs::rename(tmp, path)
}

fn to_external(snapshot_id: Ulid, record: &Record) -> Result<ExternalRecord, SyncError> {
    let Value::Object(fields) = record.fields.to_json()? else {
        return Err(SyncError::Serialization(format!(
            "record {} fields are not an object",
            record.key()
        )));
    };
    Ok(ExternalRecord {
        source_id: format!("{snapshot_id}/{}", record.key()),
        date: record.date,
        time_segment: record.time_segment,
        fields,
    })
}

/// Artifact as found on disk, with the records section kept as raw text.
#[derive(Deserialize)]
struct RawArtifact {
    header: Option<Value>,
    records: Option<Box<RawValue>>,
}

fn check_artifact(snapshot: &Snapshot, report: &mut VerificationReport) {
    let path = &snapshot.artifact_path;
    let size = match fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(err) => {
            report.issues.push(VerificationIssue::error(
                "artifact_missing",
                format!("cannot stat {}: {err}", path.display()),
            ));
            return;
        }
    };
    report.actual_file_size = Some(size);
    if size != snapshot.file_size {
        report.issues.push(VerificationIssue::warning(
            "file_size_mismatch",
            format!("expected {} bytes, found {size}", snapshot.file_size),
        ));
    }

    let document = match fs::read(path)
        .map_err(|err| ("artifact_unreadable", err.to_string()))
        .and_then(|bytes| {
            serde_json::from_slice::<RawArtifact>(&bytes)
                .map_err(|err| ("artifact_unparseable", err.to_string()))
        }) {
        Ok(document) => document,
        Err((code, message)) => {
            report.issues.push(VerificationIssue::error(code, message));
            return;
        }
    };

    let Some(raw_records) = document.records else {
        report.issues.push(VerificationIssue::error(
            "records_missing",
            "artifact has no records array",
        ));
        return;
    };
    let records_value = match serde_json::from_str::<Value>(raw_records.get()) {
        Ok(value) if value.is_array() => value,
        _ => {
            report.issues.push(VerificationIssue::error(
                "records_missing",
                "artifact has no records array",
            ));
            return;
        }
    };

    let actual = hash_bytes(raw_records.get().as_bytes());
    report.hash_match = actual == snapshot.content_hash;
    if !report.hash_match {
        report.issues.push(VerificationIssue::error(
            "content_hash_mismatch",
            format!("expected {}, computed {actual}", snapshot.content_hash),
        ));
    }
    report.actual_hash = Some(actual);

    let actual_count = records_value.as_array().map_or(0, Vec::len);
    report.actual_record_count = Some(actual_count);

    let header = document
        .header
        .ok_or_else(|| "artifact has no header".to_string())
        .and_then(|value| {
            serde_json::from_value::<SnapshotHeader>(value).map_err(|err| err.to_string())
        });
    let header_ok = match header {
        Ok(header) => {
            check_header(snapshot, &header, report);
            report.declared_record_count = Some(header.record_count);
            true
        }
        Err(message) => {
            report
                .issues
                .push(VerificationIssue::error("header_malformed", message));
            false
        }
    };

    report.record_count_match = report.declared_record_count == Some(snapshot.record_count)
        && actual_count == snapshot.record_count;
    if !report.record_count_match {
        report.issues.push(VerificationIssue::error(
            "record_count_mismatch",
            format!(
                "metadata says {}, header says {:?}, artifact holds {actual_count}",
                snapshot.record_count, report.declared_record_count
            ),
        ));
    }

    let records_ok = match serde_json::from_value::<Vec<Record>>(records_value) {
        Ok(records) => {
            check_records(&records, report);
            true
        }
        Err(err) => {
            report.issues.push(VerificationIssue::error(
                "records_malformed",
                format!("records do not decode: {err}"),
            ));
            false
        }
    };

    report.parseable = header_ok && records_ok;
}

fn check_header(snapshot: &Snapshot, header: &SnapshotHeader, report: &mut VerificationReport) {
    if header.content_hash != snapshot.content_hash {
        report.issues.push(VerificationIssue::error(
            "header_hash_mismatch",
            format!(
                "header hash {} differs from stored {}",
                header.content_hash, snapshot.content_hash
            ),
        ));
    }
    if header.snapshot_id != snapshot.snapshot_id {
        report.issues.push(VerificationIssue::error(
            "header_snapshot_id_mismatch",
            format!(
                "header names snapshot {} instead of {}",
                header.snapshot_id, snapshot.snapshot_id
            ),
        ));
    }
    if header.backup_type != snapshot.backup_type
        || header.date_from != snapshot.date_from
        || header.date_to != snapshot.date_to
    {
        report.issues.push(VerificationIssue::warning(
            "header_range_mismatch",
            format!(
                "header covers {} {}..{}, metadata {} {}..{}",
                header.backup_type,
                header.date_from,
                header.date_to,
                snapshot.backup_type,
                snapshot.date_from,
                snapshot.date_to
            ),
        ));
    }
}

fn check_records(records: &[Record], report: &mut VerificationReport) {
    for record in records {
        match record.fields.content_hash() {
            Ok(actual) if actual == record.content_hash => {}
            Ok(actual) => report.issues.push(VerificationIssue::error(
                "record_hash_mismatch",
                format!(
                    "record {} embeds {}, fields hash to {actual}",
                    record.key(),
                    record.content_hash
                ),
            )),
            Err(err) => report.issues.push(VerificationIssue::error(
                "record_hash_mismatch",
                format!("record {} cannot be hashed: {err}", record.key()),
            )),
        }
    }
}

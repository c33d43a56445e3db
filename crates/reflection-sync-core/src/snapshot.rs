use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use ulid::Ulid;

use crate::{ContentHash, DateRange, Record, RecordDate, SyncError};

pub const ARTIFACT_FORMAT_VERSION: &str = "snapshot_artifact.v1";

/// Snapshot class. Retention is applied per class.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(try_from = "String", into = "String")]
pub enum BackupType {
    Daily,
    Weekly,
    Monthly,
    Custom(String),
}

impl BackupType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Custom(label) => label,
        }
    }

    /// Accepts the three built-in classes or a custom label of 1 to 32
    /// characters drawn from `[a-z0-9-]`.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] for labels outside that alphabet.
    pub fn parse(value: &str) -> Result<Self, SyncError> {
        match value {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => {
                let valid = (1..=32).contains(&other.len())
                    && other
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
                if valid {
                    Ok(Self::Custom(other.to_string()))
                } else {
                    Err(SyncError::Validation(format!(
                        "backup type {other:?} MUST be daily, weekly, monthly or a [a-z0-9-]{{1,32}} label"
                    )))
                }
            }
        }
    }

    /// Range a snapshot of this class covers when the caller gives none.
    /// Custom labels default to the single day.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] at the edges of the calendar.
    pub fn default_range(&self, today: RecordDate) -> Result<DateRange, SyncError> {
        match self {
            Self::Daily | Self::Custom(_) => Ok(DateRange::single(today)),
            Self::Weekly => DateRange::week_containing(today),
            Self::Monthly => DateRange::month_containing(today),
        }
    }
}

impl Display for BackupType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for BackupType {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BackupType> for String {
    fn from(value: BackupType) -> Self {
        value.as_str().to_string()
    }
}

/// Metadata block at the top of every artifact. `content_hash` covers the
/// canonical serialization of the `records` array only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub format_version: String,
    pub snapshot_id: Ulid,
    pub backup_type: BackupType,
    pub range_label: String,
    pub date_from: RecordDate,
    pub date_to: RecordDate,
    pub record_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub content_hash: ContentHash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotArtifact {
    pub header: SnapshotHeader,
    pub records: Vec<Record>,
}

/// Metadata row for a published artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub snapshot_id: Ulid,
    pub backup_type: BackupType,
    pub date_from: RecordDate,
    pub date_to: RecordDate,
    pub range_label: String,
    pub artifact_path: PathBuf,
    pub record_count: usize,
    pub file_size: u64,
    pub content_hash: ContentHash,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Snapshot {
    #[must_use]
    pub fn range(&self) -> DateRange {
        DateRange {
            from: self.date_from,
            to: self.date_to,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VerificationIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub message: String,
}

impl VerificationIssue {
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: IssueSeverity::Error,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: IssueSeverity::Warning,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VerificationReport {
    pub contract_version: String,
    pub snapshot_id: Ulid,
    pub artifact_path: PathBuf,
    pub verified: bool,
    pub parseable: bool,
    pub hash_match: bool,
    pub record_count_match: bool,
    pub expected_hash: ContentHash,
    pub actual_hash: Option<ContentHash>,
    pub expected_record_count: usize,
    pub declared_record_count: Option<usize>,
    pub actual_record_count: Option<usize>,
    pub expected_file_size: u64,
    pub actual_file_size: Option<u64>,
    pub issues: Vec<VerificationIssue>,
}

impl VerificationReport {
    pub const CONTRACT_VERSION: &'static str = "verification_report.v1";

    /// Report with every check unset, to be filled in by the verifier.
    #[must_use]
    pub fn pending(snapshot: &Snapshot) -> Self {
        Self {
            contract_version: Self::CONTRACT_VERSION.to_string(),
            snapshot_id: snapshot.snapshot_id,
            artifact_path: snapshot.artifact_path.clone(),
            verified: false,
            parseable: false,
            hash_match: false,
            record_count_match: false,
            expected_hash: snapshot.content_hash.clone(),
            actual_hash: None,
            expected_record_count: snapshot.record_count,
            declared_record_count: None,
            actual_record_count: None,
            expected_file_size: snapshot.file_size,
            actual_file_size: None,
            issues: Vec::new(),
        }
    }

    /// Marks the report verified when no error-severity issue was recorded.
    pub fn finish(&mut self) {
        self.verified = self.parseable
            && self.hash_match
            && self.record_count_match
            && !self
                .issues
                .iter()
                .any(|issue| issue.severity == IssueSeverity::Error);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CleanupReport {
    pub contract_version: String,
    pub backup_type: BackupType,
    pub max_age_days: u32,
    pub deleted_count: usize,
    pub bytes_freed: u64,
    pub deleted: Vec<PathBuf>,
    pub missing_artifacts: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub const CONTRACT_VERSION: &'static str = "cleanup_report.v1";

    #[must_use]
    pub fn new(backup_type: BackupType, max_age_days: u32) -> Self {
        Self {
            contract_version: Self::CONTRACT_VERSION.to_string(),
            backup_type,
            max_age_days,
            deleted_count: 0,
            bytes_freed: 0,
            deleted: Vec::new(),
            missing_artifacts: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Parts encoded in an artifact file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFileName {
    pub backup_type: BackupType,
    pub range_label: String,
    pub created_at: OffsetDateTime,
    pub snapshot_id: Ulid,
}

/// `<type>_<range_label>_<YYYYMMDDTHHMMSSZ>_<snapshot_id>.json`
///
/// # Errors
/// Returns [`SyncError::Serialization`] if the timestamp cannot be formatted.
pub fn artifact_file_name(
    backup_type: &BackupType,
    range_label: &str,
    created_at: OffsetDateTime,
    snapshot_id: Ulid,
) -> Result<String, SyncError> {
    let stamp = created_at
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year][month][day]T[hour][minute][second]Z"
        ))
        .map_err(|err| SyncError::Serialization(format!("failed to format file stamp: {err}")))?;
    Ok(format!("{backup_type}_{range_label}_{stamp}_{snapshot_id}.json"))
}

/// Inverse of [`artifact_file_name`]; `None` when the name does not follow
/// the layout.
#[must_use]
pub fn parse_artifact_file_name(name: &str) -> Option<ArtifactFileName> {
    let stem = name.strip_suffix(".json")?;
    let mut tail = stem.rsplitn(3, '_');
    let snapshot_id = Ulid::from_string(tail.next()?).ok()?;
    let stamp = tail.next()?;
    let (backup_type, range_label) = tail.next()?.split_once('_')?;

    let created_at = PrimitiveDateTime::parse(
        stamp,
        format_description!("[year][month][day]T[hour][minute][second]Z"),
    )
    .ok()?
    .assume_utc();

    Some(ArtifactFileName {
        backup_type: BackupType::parse(backup_type).ok()?,
        range_label: range_label.to_string(),
        created_at,
        snapshot_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn backup_type_accepts_builtins_and_safe_labels() {
        assert_eq!(must(BackupType::parse("weekly")), BackupType::Weekly);
        assert_eq!(
            must(BackupType::parse("pre-migration")),
            BackupType::Custom("pre-migration".to_string())
        );
        assert!(BackupType::parse("").is_err());
        assert!(BackupType::parse("Has_Upper").is_err());
        assert!(BackupType::parse("../escape").is_err());
        assert!(BackupType::parse(&"a".repeat(33)).is_err());
    }

    #[test]
    fn default_ranges_follow_backup_class() {
        let today = must(RecordDate::parse("2025-07-05"));
        assert_eq!(must(BackupType::Daily.default_range(today)).label(), "2025-07-05");
        assert_eq!(
            must(BackupType::Weekly.default_range(today)).label(),
            "2025-06-30_2025-07-06"
        );
        assert_eq!(
            must(BackupType::Monthly.default_range(today)).label(),
            "2025-07-01_2025-07-31"
        );
    }

    #[test]
    fn file_name_round_trips_with_multi_day_label() {
        let created_at = must(crate::parse_rfc3339_utc("2025-07-06T21:30:05Z"));
        let id = Ulid::new();
        let name = must(artifact_file_name(
            &BackupType::Weekly,
            "2025-06-30_2025-07-06",
            created_at,
            id,
        ));
        assert_eq!(
            name,
            format!("weekly_2025-06-30_2025-07-06_20250706T213005Z_{id}.json")
        );

        let parsed = parse_artifact_file_name(&name);
        assert_eq!(
            parsed,
            Some(ArtifactFileName {
                backup_type: BackupType::Weekly,
                range_label: "2025-06-30_2025-07-06".to_string(),
                created_at,
                snapshot_id: id,
            })
        );
    }

    #[test]
    fn unrecognized_file_names_do_not_parse() {
        assert_eq!(parse_artifact_file_name("notes.json"), None);
        assert_eq!(parse_artifact_file_name("daily_2025-07-05_garbage_x.json"), None);
        assert_eq!(parse_artifact_file_name("3part_daily_backup_2025-07-05.json"), None);
    }

    #[test]
    fn report_is_not_verified_with_error_issue() {
        let snapshot = Snapshot {
            snapshot_id: Ulid::new(),
            backup_type: BackupType::Daily,
            date_from: must(RecordDate::parse("2025-07-05")),
            date_to: must(RecordDate::parse("2025-07-05")),
            range_label: "2025-07-05".to_string(),
            artifact_path: PathBuf::from("x.json"),
            record_count: 1,
            file_size: 10,
            content_hash: crate::hash_bytes(b"x"),
            created_at: crate::now_utc(),
        };
        let mut report = VerificationReport::pending(&snapshot);
        report.parseable = true;
        report.hash_match = true;
        report.record_count_match = true;
        report.issues.push(VerificationIssue::warning("file_size_mismatch", "size"));
        report.finish();
        assert!(report.verified);

        report
            .issues
            .push(VerificationIssue::error("record_hash_mismatch", "bad"));
        report.finish();
        assert!(!report.verified);
    }
}

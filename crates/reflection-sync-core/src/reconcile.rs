use serde::{Deserialize, Serialize};

use crate::{ContentHash, RecordKey, SyncError};

/// How an incoming record relates to local state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Changed,
    Unchanged,
}

impl Classification {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Changed => "changed",
            Self::Unchanged => "unchanged",
        }
    }

    #[must_use]
    pub fn needs_write(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Hash comparison is the only change signal.
#[must_use]
pub fn classify(local: Option<&ContentHash>, incoming: &ContentHash) -> Classification {
    match local {
        None => Classification::New,
        Some(existing) if existing == incoming => Classification::Unchanged,
        Some(_) => Classification::Changed,
    }
}

/// What an upsert actually did to the stored row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RecordChange {
    Inserted,
    Updated,
    Unchanged,
}

impl RecordChange {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

impl From<RecordChange> for Classification {
    fn from(value: RecordChange) -> Self {
        match value {
            RecordChange::Inserted => Self::New,
            RecordChange::Updated => Self::Changed,
            RecordChange::Unchanged => Self::Unchanged,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "partial_success" => Some(Self::PartialSuccess),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// An empty batch is a success; a batch where every record failed is not.
    #[must_use]
    pub fn from_counts(received: usize, failed: usize) -> Self {
        if failed == 0 {
            Self::Success
        } else if failed >= received {
            Self::Failed
        } else {
            Self::PartialSuccess
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordOutcome {
    pub source_id: String,
    pub key: RecordKey,
    pub classification: Classification,
    pub content_hash: ContentHash,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordFailure {
    pub source_id: String,
    pub key: RecordKey,
    pub code: String,
    pub error: String,
}

impl RecordFailure {
    #[must_use]
    pub fn new(source_id: &str, key: RecordKey, error: &SyncError) -> Self {
        Self {
            source_id: source_id.to_string(),
            key,
            code: error.code().to_string(),
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SyncResult {
    pub contract_version: String,
    pub source: String,
    pub action: String,
    pub received: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub status: SyncStatus,
    pub outcomes: Vec<RecordOutcome>,
    pub failures: Vec<RecordFailure>,
    pub log_entry_seq: i64,
}

impl SyncResult {
    pub const CONTRACT_VERSION: &'static str = "sync_result.v1";

    /// Tallies outcomes and failures; `log_entry_seq` is filled in once the
    /// audit row has been appended.
    #[must_use]
    pub fn tally(
        source: &str,
        action: &str,
        received: usize,
        outcomes: Vec<RecordOutcome>,
        failures: Vec<RecordFailure>,
    ) -> Self {
        let count = |wanted: Classification| {
            outcomes
                .iter()
                .filter(|outcome| outcome.classification == wanted)
                .count()
        };
        Self {
            contract_version: Self::CONTRACT_VERSION.to_string(),
            source: source.to_string(),
            action: action.to_string(),
            received,
            new: count(Classification::New),
            changed: count(Classification::Changed),
            unchanged: count(Classification::Unchanged),
            failed: failures.len(),
            status: SyncStatus::from_counts(received, failures.len()),
            outcomes,
            failures,
            log_entry_seq: 0,
        }
    }

    /// One-line failure summary for the audit log, `None` on full success.
    #[must_use]
    pub fn error_summary(&self) -> Option<String> {
        let first = self.failures.first()?;
        let mut summary = format!(
            "{} of {} records failed; first: {} {}",
            self.failed, self.received, first.key, first.error
        );
        if summary.len() > 512 {
            let mut cut = 512;
            while !summary.is_char_boundary(cut) {
                cut -= 1;
            }
            summary.truncate(cut);
        }
        Some(summary)
    }

    #[must_use]
    pub fn written(&self) -> usize {
        self.new + self.changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hash_bytes, RecordDate, TimeSegment};

    fn key() -> RecordKey {
        match RecordDate::parse("2025-07-05") {
            Ok(date) => RecordKey {
                date,
                time_segment: TimeSegment::Morning,
            },
            Err(err) => panic!("fixture date: {err}"),
        }
    }

    #[test]
    fn classify_compares_hashes_only() {
        let a = hash_bytes(b"a");
        let b = hash_bytes(b"b");
        assert_eq!(classify(None, &a), Classification::New);
        assert_eq!(classify(Some(&a), &a), Classification::Unchanged);
        assert_eq!(classify(Some(&a), &b), Classification::Changed);
    }

    #[test]
    fn status_follows_failure_share() {
        assert_eq!(SyncStatus::from_counts(0, 0), SyncStatus::Success);
        assert_eq!(SyncStatus::from_counts(3, 0), SyncStatus::Success);
        assert_eq!(SyncStatus::from_counts(3, 1), SyncStatus::PartialSuccess);
        assert_eq!(SyncStatus::from_counts(3, 3), SyncStatus::Failed);
    }

    #[test]
    fn tally_counts_each_classification() {
        let hash = hash_bytes(b"x");
        let outcome = |classification| RecordOutcome {
            source_id: "s".to_string(),
            key: key(),
            classification,
            content_hash: hash.clone(),
        };
        let failure = RecordFailure::new(
            "bad",
            key(),
            &SyncError::Validation("unknown field mood".to_string()),
        );
        let result = SyncResult::tally(
            "static",
            "reconcile",
            4,
            vec![
                outcome(Classification::New),
                outcome(Classification::Unchanged),
                outcome(Classification::Unchanged),
            ],
            vec![failure],
        );
        assert_eq!((result.new, result.changed, result.unchanged), (1, 0, 2));
        assert_eq!(result.failed, 1);
        assert_eq!(result.status, SyncStatus::PartialSuccess);
        let summary = result.error_summary().unwrap_or_default();
        assert!(summary.starts_with("1 of 4 records failed"));
        assert_eq!(result.failures[0].code, "validation");
    }
}

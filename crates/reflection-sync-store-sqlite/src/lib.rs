#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reflection_sync_core::{
    format_rfc3339, parse_rfc3339_utc, BackupType, Clock, ContentAddresser, ContentHash, DateRange,
    FieldMap, Record, RecordChange, RecordDate, RecordKey, RecordSchema, Snapshot, SyncError,
    SyncLogEntry, SyncStatus, SystemClock, TimeSegment,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod reconcile;
mod retention;
mod snapshot;

pub use retention::RetentionManager;
pub use snapshot::SnapshotManager;

const RECORD_MIGRATION_VERSION: i64 = 1;

const SCHEMA_RECORDS_V1: &str = r"
CREATE TABLE IF NOT EXISTS records (
  record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  date TEXT NOT NULL,
  time_segment TEXT NOT NULL CHECK (time_segment IN ('morning', 'afternoon', 'evening')),
  fields_json TEXT NOT NULL,
  content_hash TEXT NOT NULL CHECK (length(content_hash) = 64),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(date, time_segment)
);

CREATE TABLE IF NOT EXISTS snapshots (
  snapshot_id TEXT PRIMARY KEY,
  backup_type TEXT NOT NULL,
  date_from TEXT NOT NULL,
  date_to TEXT NOT NULL,
  range_label TEXT NOT NULL,
  artifact_path TEXT NOT NULL UNIQUE,
  record_count INTEGER NOT NULL CHECK (record_count >= 0),
  file_size INTEGER NOT NULL CHECK (file_size >= 0),
  content_hash TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_type_created
  ON snapshots(backup_type, created_at);

CREATE TABLE IF NOT EXISTS sync_log (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  source TEXT NOT NULL,
  target TEXT NOT NULL,
  action TEXT NOT NULL,
  record_count INTEGER NOT NULL CHECK (record_count >= 0),
  status TEXT NOT NULL CHECK (status IN ('success', 'partial_success', 'failed')),
  error_message TEXT,
  timestamp TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_sync_log_no_update
BEFORE UPDATE ON sync_log
BEGIN
  SELECT RAISE(FAIL, 'sync_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_sync_log_no_delete
BEFORE DELETE ON sync_log
BEGIN
  SELECT RAISE(FAIL, 'sync_log is append-only');
END;
";

const RECORD_COLUMNS: &str =
    "date, time_segment, fields_json, content_hash, created_at, updated_at";

const SEGMENT_ORDER: &str = "CASE time_segment
    WHEN 'morning' THEN 1
    WHEN 'afternoon' THEN 2
    WHEN 'evening' THEN 3
    ELSE 4
  END";

const SNAPSHOT_COLUMNS: &str = "snapshot_id, backup_type, date_from, date_to, range_label, \
     artifact_path, record_count, file_size, content_hash, created_at";

/// Attaches a message to low-level storage errors, in the manner of
/// `anyhow::Context`, yielding [`SyncError::StoreUnavailable`].
pub(crate) trait StoreContext<T> {
    fn context(self, message: &str) -> Result<T, SyncError>;
}

impl<T> StoreContext<T> for rusqlite::Result<T> {
    fn context(self, message: &str) -> Result<T, SyncError> {
        self.map_err(|err| SyncError::StoreUnavailable(format!("{message}: {err}")))
    }
}

/// Result of a single [`SqliteRecordStore::upsert`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpsertResult {
    pub record: Record,
    pub change: RecordChange,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupTypeStatistics {
    pub backup_type: BackupType,
    pub snapshot_count: usize,
    pub total_bytes: u64,
    pub total_records: usize,
    pub average_records: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub latest_created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupStatistics {
    pub contract_version: String,
    pub generated_at: String,
    pub record_count: usize,
    pub snapshot_count: usize,
    pub total_bytes: u64,
    pub by_type: Vec<BackupTypeStatistics>,
    pub recent: Vec<Snapshot>,
}

/// Local Store backed by one SQLite database file.
pub struct SqliteRecordStore {
    conn: Connection,
    location: String,
    addresser: ContentAddresser,
    clock: Arc<dyn Clock>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let conn = Connection::open(path).map_err(|err| {
            SyncError::StoreUnavailable(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            location: format!("sqlite:{}", path.display()),
            addresser: ContentAddresser::reflection_v1(),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_schema(mut self, schema: RecordSchema) -> Result<Self, SyncError> {
        self.addresser = ContentAddresser::new(schema)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn migrate(&self) -> Result<(), SyncError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_RECORDS_V1)
            .context("failed to apply record schema")?;

        let now = format_rfc3339(self.clock.now())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RECORD_MIGRATION_VERSION, now],
            )
            .context("failed to register record schema migration")?;

        Ok(())
    }

    /// Identifier of this store used as the `target` of sync log entries.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    #[must_use]
    pub fn addresser(&self) -> &ContentAddresser {
        &self.addresser
    }

    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Inserts or replaces the record for `key`. The hash comparison and the
    /// write share one immediate transaction.
    pub fn upsert(&mut self, key: RecordKey, fields: FieldMap) -> Result<UpsertResult, SyncError> {
        let (fields, content_hash) = self.addresser.address(fields)?;
        let fields_json = serde_json::to_string(&fields.to_json()?).map_err(|err| {
            SyncError::Serialization(format!("failed to serialize fields for {key}: {err}"))
        })?;
        let now = self.clock.now();
        let now_text = format_rfc3339(now)?;
        let date_text = key.date.to_string();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start upsert transaction")?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records WHERE date = ?1 AND time_segment = ?2"
                ),
                params![date_text, key.time_segment.as_str()],
                parse_record_row,
            )
            .optional()
            .context("failed to load existing record")?;

        let result = match existing {
            Some(current) if current.content_hash == content_hash => UpsertResult {
                record: current,
                change: RecordChange::Unchanged,
            },
            Some(current) => {
                tx.execute(
                    "UPDATE records
                     SET fields_json = ?1, content_hash = ?2, updated_at = ?3
                     WHERE date = ?4 AND time_segment = ?5",
                    params![
                        fields_json,
                        content_hash.as_str(),
                        now_text,
                        date_text,
                        key.time_segment.as_str()
                    ],
                )
                .context("failed to update record")?;
                UpsertResult {
                    record: Record {
                        date: key.date,
                        time_segment: key.time_segment,
                        fields,
                        content_hash,
                        created_at: current.created_at,
                        updated_at: now,
                    },
                    change: RecordChange::Updated,
                }
            }
            None => {
                tx.execute(
                    "INSERT INTO records(date, time_segment, fields_json, content_hash, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![
                        date_text,
                        key.time_segment.as_str(),
                        fields_json,
                        content_hash.as_str(),
                        now_text
                    ],
                )
                .context("failed to insert record")?;
                UpsertResult {
                    record: Record {
                        date: key.date,
                        time_segment: key.time_segment,
                        fields,
                        content_hash,
                        created_at: now,
                        updated_at: now,
                    },
                    change: RecordChange::Inserted,
                }
            }
        };

        tx.commit().context("failed to commit upsert transaction")?;
        Ok(result)
    }

    pub fn get(&self, key: RecordKey) -> Result<Option<Record>, SyncError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records WHERE date = ?1 AND time_segment = ?2"
                ),
                params![key.date.to_string(), key.time_segment.as_str()],
                parse_record_row,
            )
            .optional()
            .context("failed to load record")
    }

    /// Records with `range.from <= date <= range.to`, ordered by date and
    /// then morning, afternoon, evening.
    pub fn get_range(&self, range: DateRange) -> Result<Vec<Record>, SyncError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE date >= ?1 AND date <= ?2
                 ORDER BY date ASC, {SEGMENT_ORDER} ASC"
            ))
            .context("failed to prepare range query")?;
        let rows = stmt
            .query_map(
                params![range.from.to_string(), range.to.to_string()],
                parse_record_row,
            )
            .context("failed to query record range")?;
        collect_rows(rows)
    }

    pub fn count_records(&self) -> Result<usize, SyncError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .context("failed to count records")?;
        usize::try_from(count)
            .map_err(|_| SyncError::StoreUnavailable(format!("invalid record count {count}")))
    }

    pub(crate) fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), SyncError> {
        self.conn
            .execute(
                &format!("INSERT INTO snapshots({SNAPSHOT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    snapshot.snapshot_id.to_string(),
                    snapshot.backup_type.as_str(),
                    snapshot.date_from.to_string(),
                    snapshot.date_to.to_string(),
                    snapshot.range_label,
                    path_to_sql(&snapshot.artifact_path)?,
                    to_sql_count(snapshot.record_count)?,
                    i64::try_from(snapshot.file_size).map_err(|_| {
                        SyncError::Validation(format!("file size {} out of range", snapshot.file_size))
                    })?,
                    snapshot.content_hash.as_str(),
                    format_rfc3339(snapshot.created_at)?,
                ],
            )
            .context("failed to record snapshot metadata")?;
        Ok(())
    }

    pub(crate) fn delete_snapshot(&self, snapshot_id: Ulid) -> Result<(), SyncError> {
        self.conn
            .execute(
                "DELETE FROM snapshots WHERE snapshot_id = ?1",
                params![snapshot_id.to_string()],
            )
            .context("failed to delete snapshot metadata")?;
        Ok(())
    }

    pub fn get_snapshot(&self, snapshot_id: Ulid) -> Result<Snapshot, SyncError> {
        self.conn
            .query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE snapshot_id = ?1"),
                params![snapshot_id.to_string()],
                parse_snapshot_row,
            )
            .optional()
            .context("failed to load snapshot")?
            .ok_or_else(|| SyncError::NotFound(format!("snapshot {snapshot_id}")))
    }

    /// Snapshots newest first, optionally restricted to one class.
    pub fn list_snapshots(
        &self,
        backup_type: Option<&BackupType>,
    ) -> Result<Vec<Snapshot>, SyncError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
                 WHERE ?1 IS NULL OR backup_type = ?1
                 ORDER BY created_at DESC, snapshot_id DESC"
            ))
            .context("failed to prepare snapshot listing")?;
        let rows = stmt
            .query_map(
                params![backup_type.map(BackupType::as_str)],
                parse_snapshot_row,
            )
            .context("failed to list snapshots")?;
        collect_rows(rows)
    }

    pub(crate) fn append_sync_log(
        &self,
        source: &str,
        action: &str,
        record_count: usize,
        status: SyncStatus,
        error_message: Option<&str>,
    ) -> Result<SyncLogEntry, SyncError> {
        let timestamp = self.clock.now();
        self.conn
            .execute(
                "INSERT INTO sync_log(source, target, action, record_count, status, error_message, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    source,
                    self.location,
                    action,
                    to_sql_count(record_count)?,
                    status.as_str(),
                    error_message,
                    format_rfc3339(timestamp)?,
                ],
            )
            .context("failed to append sync log entry")?;

        Ok(SyncLogEntry {
            entry_seq: self.conn.last_insert_rowid(),
            source: source.to_string(),
            target: self.location.clone(),
            action: action.to_string(),
            record_count,
            status,
            error_message: error_message.map(str::to_string),
            timestamp,
        })
    }

    /// Most recent entries first.
    pub fn list_sync_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>, SyncError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT entry_seq, source, target, action, record_count, status, error_message, timestamp
                 FROM sync_log
                 ORDER BY entry_seq DESC
                 LIMIT ?1",
            )
            .context("failed to prepare sync log listing")?;
        let rows = stmt
            .query_map(params![to_sql_count(limit)?], parse_sync_log_row)
            .context("failed to list sync log")?;
        collect_rows(rows)
    }

    /// Per-class snapshot totals plus the five most recent snapshots.
    #[allow(clippy::cast_precision_loss)]
    pub fn backup_statistics(&self) -> Result<BackupStatistics, SyncError> {
        let snapshots = self.list_snapshots(None)?;
        let mut by_type: Vec<BackupTypeStatistics> = Vec::new();

        for snapshot in &snapshots {
            let position = by_type
                .iter()
                .position(|stats| stats.backup_type == snapshot.backup_type);
            let stats = match position {
                Some(index) => &mut by_type[index],
                None => {
                    by_type.push(BackupTypeStatistics {
                        backup_type: snapshot.backup_type.clone(),
                        snapshot_count: 0,
                        total_bytes: 0,
                        total_records: 0,
                        average_records: 0.0,
                        latest_created_at: None,
                    });
                    let last = by_type.len() - 1;
                    &mut by_type[last]
                }
            };
            stats.snapshot_count += 1;
            stats.total_bytes += snapshot.file_size;
            stats.total_records += snapshot.record_count;
            stats.latest_created_at = Some(
                stats
                    .latest_created_at
                    .map_or(snapshot.created_at, |latest| latest.max(snapshot.created_at)),
            );
        }

        for stats in &mut by_type {
            stats.average_records = stats.total_records as f64 / stats.snapshot_count as f64;
        }
        by_type.sort_by(|lhs, rhs| lhs.backup_type.cmp(&rhs.backup_type));

        Ok(BackupStatistics {
            contract_version: "backup_statistics.v1".to_string(),
            generated_at: format_rfc3339(self.clock.now())?,
            record_count: self.count_records()?,
            snapshot_count: snapshots.len(),
            total_bytes: snapshots.iter().map(|snapshot| snapshot.file_size).sum(),
            by_type,
            recent: snapshots.into_iter().take(5).collect(),
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn conversion_error(index: usize, ty: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn text_column<T>(index: usize, parsed: Result<T, SyncError>) -> rusqlite::Result<T> {
    parsed.map_err(|err| conversion_error(index, rusqlite::types::Type::Text, err.to_string()))
}

fn count_column(index: usize, raw: i64) -> rusqlite::Result<usize> {
    usize::try_from(raw).map_err(|_| {
        conversion_error(
            index,
            rusqlite::types::Type::Integer,
            format!("invalid count: {raw}"),
        )
    })
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let date_raw: String = row.get(0)?;
    let segment_raw: String = row.get(1)?;
    let fields_raw: String = row.get(2)?;
    let hash_raw: String = row.get(3)?;
    let created_raw: String = row.get(4)?;
    let updated_raw: String = row.get(5)?;

    let time_segment = TimeSegment::parse(&segment_raw).ok_or_else(|| {
        conversion_error(
            1,
            rusqlite::types::Type::Text,
            format!("invalid time_segment: {segment_raw}"),
        )
    })?;
    let fields: FieldMap = serde_json::from_str(&fields_raw).map_err(|err| {
        conversion_error(
            2,
            rusqlite::types::Type::Text,
            format!("invalid fields_json: {err}"),
        )
    })?;

    Ok(Record {
        date: text_column(0, RecordDate::parse(&date_raw))?,
        time_segment,
        fields,
        content_hash: text_column(3, ContentHash::parse(&hash_raw))?,
        created_at: text_column(4, parse_rfc3339_utc(&created_raw))?,
        updated_at: text_column(5, parse_rfc3339_utc(&updated_raw))?,
    })
}

fn parse_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snapshot> {
    let id_raw: String = row.get(0)?;
    let type_raw: String = row.get(1)?;
    let from_raw: String = row.get(2)?;
    let to_raw: String = row.get(3)?;
    let range_label: String = row.get(4)?;
    let path_raw: String = row.get(5)?;
    let record_count: i64 = row.get(6)?;
    let file_size: i64 = row.get(7)?;
    let hash_raw: String = row.get(8)?;
    let created_raw: String = row.get(9)?;

    let snapshot_id = Ulid::from_string(&id_raw).map_err(|err| {
        conversion_error(
            0,
            rusqlite::types::Type::Text,
            format!("invalid snapshot_id {id_raw}: {err}"),
        )
    })?;
    let file_size = u64::try_from(file_size).map_err(|_| {
        conversion_error(
            7,
            rusqlite::types::Type::Integer,
            format!("invalid file_size: {file_size}"),
        )
    })?;

    Ok(Snapshot {
        snapshot_id,
        backup_type: text_column(1, BackupType::parse(&type_raw))?,
        date_from: text_column(2, RecordDate::parse(&from_raw))?,
        date_to: text_column(3, RecordDate::parse(&to_raw))?,
        range_label,
        artifact_path: PathBuf::from(path_raw),
        record_count: count_column(6, record_count)?,
        file_size,
        content_hash: text_column(8, ContentHash::parse(&hash_raw))?,
        created_at: text_column(9, parse_rfc3339_utc(&created_raw))?,
    })
}

fn parse_sync_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncLogEntry> {
    let record_count: i64 = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let timestamp_raw: String = row.get(7)?;

    let status = SyncStatus::parse(&status_raw).ok_or_else(|| {
        conversion_error(
            5,
            rusqlite::types::Type::Text,
            format!("invalid status: {status_raw}"),
        )
    })?;

    Ok(SyncLogEntry {
        entry_seq: row.get(0)?,
        source: row.get(1)?,
        target: row.get(2)?,
        action: row.get(3)?,
        record_count: count_column(4, record_count)?,
        status,
        error_message: row.get(6)?,
        timestamp: text_column(7, parse_rfc3339_utc(&timestamp_raw))?,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, SyncError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.context("failed to decode row")?);
    }
    Ok(values)
}

fn to_sql_count(value: usize) -> Result<i64, SyncError> {
    i64::try_from(value).map_err(|_| SyncError::Validation(format!("count {value} out of range")))
}

fn path_to_sql(path: &Path) -> Result<&str, SyncError> {
    path.to_str().ok_or_else(|| {
        SyncError::Validation(format!("artifact path {} is not valid UTF-8", path.display()))
    })
}

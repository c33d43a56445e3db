use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

mod config;
mod fields;
mod reconcile;
mod snapshot;
mod source;

pub use config::{EngineConfig, RetentionConfig};
pub use fields::{
    canonical_json_bytes, hash_bytes, ContentAddresser, ContentHash, FieldKind, FieldMap,
    FieldSpec, FieldValue, RecordSchema, MAX_TEXT_CHARS,
};
pub use reconcile::{
    classify, Classification, RecordChange, RecordFailure, RecordOutcome, SyncResult, SyncStatus,
};
pub use snapshot::{
    artifact_file_name, parse_artifact_file_name, ArtifactFileName, BackupType, CleanupReport,
    IssueSeverity, Snapshot, SnapshotArtifact, SnapshotHeader, VerificationIssue,
    VerificationReport, ARTIFACT_FORMAT_VERSION,
};
pub use source::{ExternalRecord, JsonFileSource, RecordSource, StaticSource};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("snapshot write error: {0}")]
    SnapshotWrite(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SyncError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Serialization(_) => "serialization",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::SnapshotWrite(_) => "snapshot_write",
            Self::NotFound(_) => "not_found",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// Fixed segment of the day a record belongs to. Declaration order is the
/// canonical ordering used by range queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimeSegment {
    Morning,
    Afternoon,
    Evening,
}

impl TimeSegment {
    pub const ALL: [Self; 3] = [Self::Morning, Self::Afternoon, Self::Evening];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::Afternoon => "afternoon",
            Self::Evening => "evening",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "morning" => Some(Self::Morning),
            "afternoon" => Some(Self::Afternoon),
            "evening" => Some(Self::Evening),
            _ => None,
        }
    }

    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Morning => 1,
            Self::Afternoon => 2,
            Self::Evening => 3,
        }
    }
}

impl Display for TimeSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calendar date of a record, serialized as `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct RecordDate(Date);

impl RecordDate {
    #[must_use]
    pub fn new(date: Date) -> Self {
        Self(date)
    }

    /// Parses a `YYYY-MM-DD` calendar date.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the value is not a valid date.
    pub fn parse(value: &str) -> Result<Self, SyncError> {
        Date::parse(value.trim(), format_description!("[year]-[month]-[day]"))
            .map(Self)
            .map_err(|err| SyncError::Validation(format!("invalid date {value:?}: {err}")))
    }

    #[must_use]
    pub fn date(self) -> Date {
        self.0
    }

    /// Shifts the date by a signed number of days.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the result leaves the supported range.
    pub fn offset_days(self, days: i64) -> Result<Self, SyncError> {
        self.0
            .checked_add(Duration::days(days))
            .map(Self)
            .ok_or_else(|| SyncError::Validation(format!("date out of range: {self} + {days}d")))
    }
}

impl Display for RecordDate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let formatted = self
            .0
            .format(format_description!("[year]-[month]-[day]"))
            .map_err(|_| std::fmt::Error)?;
        f.write_str(&formatted)
    }
}

impl FromStr for RecordDate {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for RecordDate {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RecordDate> for String {
    fn from(value: RecordDate) -> Self {
        value.to_string()
    }
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct DateRange {
    pub from: RecordDate,
    pub to: RecordDate,
}

impl DateRange {
    /// Builds an inclusive range.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when `from` is after `to`.
    pub fn new(from: RecordDate, to: RecordDate) -> Result<Self, SyncError> {
        if from > to {
            return Err(SyncError::Validation(format!(
                "date range start {from} MUST NOT be after end {to}"
            )));
        }
        Ok(Self { from, to })
    }

    #[must_use]
    pub fn single(date: RecordDate) -> Self {
        Self {
            from: date,
            to: date,
        }
    }

    /// Monday through Sunday of the week containing `date`.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] at the edges of the supported calendar.
    pub fn week_containing(date: RecordDate) -> Result<Self, SyncError> {
        let from =
            date.offset_days(-i64::from(date.date().weekday().number_days_from_monday()))?;
        let to = from.offset_days(6)?;
        Ok(Self { from, to })
    }

    /// First through last day of the month containing `date`.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the month bounds cannot be built.
    pub fn month_containing(date: RecordDate) -> Result<Self, SyncError> {
        let inner = date.date();
        let last_day = time::util::days_in_year_month(inner.year(), inner.month());
        let from = Date::from_calendar_date(inner.year(), inner.month(), 1)
            .map_err(|err| SyncError::Validation(format!("invalid month start: {err}")))?;
        let to = Date::from_calendar_date(inner.year(), inner.month(), last_day)
            .map_err(|err| SyncError::Validation(format!("invalid month end: {err}")))?;
        Ok(Self {
            from: RecordDate(from),
            to: RecordDate(to),
        })
    }

    /// The `days` calendar days ending at `today` (inclusive).
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when `days` is zero.
    pub fn trailing_days(today: RecordDate, days: u32) -> Result<Self, SyncError> {
        if days == 0 {
            return Err(SyncError::Validation("lookback days MUST be >= 1".to_string()));
        }
        let from = today.offset_days(-(i64::from(days) - 1))?;
        Ok(Self { from, to: today })
    }

    #[must_use]
    pub fn contains(&self, date: RecordDate) -> bool {
        self.from <= date && date <= self.to
    }

    /// `YYYY-MM-DD` for single-day ranges, `YYYY-MM-DD_YYYY-MM-DD` otherwise.
    #[must_use]
    pub fn label(&self) -> String {
        if self.from == self.to {
            self.from.to_string()
        } else {
            format!("{}_{}", self.from, self.to)
        }
    }

    /// Smallest range covering every date in `dates`, or `None` when empty.
    #[must_use]
    pub fn spanning(dates: impl IntoIterator<Item = RecordDate>) -> Option<Self> {
        let mut iter = dates.into_iter();
        let first = iter.next()?;
        let (from, to) = iter.fold((first, first), |(lo, hi), date| {
            (lo.min(date), hi.max(date))
        });
        Some(Self { from, to })
    }
}

impl Display for DateRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

/// Unique identity of a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordKey {
    pub date: RecordDate,
    pub time_segment: TimeSegment,
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.date, self.time_segment)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub date: RecordDate,
    pub time_segment: TimeSegment,
    pub fields: FieldMap,
    pub content_hash: ContentHash,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Record {
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            date: self.date,
            time_segment: self.time_segment,
        }
    }
}

/// Append-only audit row written once per reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncLogEntry {
    pub entry_seq: i64,
    pub source: String,
    pub target: String,
    pub action: String,
    pub record_count: usize,
    pub status: SyncStatus,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Source of "now" for every timestamp the engine writes.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    /// Calendar date of [`Clock::now`] in UTC.
    fn today(&self) -> RecordDate {
        RecordDate(self.now().to_offset(UtcOffset::UTC).date())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start.to_offset(UtcOffset::UTC)),
        }
    }

    pub fn set(&self, value: OffsetDateTime) {
        let mut guard = match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = value.to_offset(UtcOffset::UTC);
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`SyncError::Validation`] when parsing fails or the offset is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, SyncError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| SyncError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(SyncError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`SyncError::Serialization`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SyncError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            SyncError::Serialization(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
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

    fn date(raw: &str) -> RecordDate {
        must(RecordDate::parse(raw))
    }

    #[test]
    fn record_date_round_trips_through_json_as_plain_string() {
        let value = must(serde_json::to_value(date("2025-07-05")));
        assert_eq!(value, serde_json::json!("2025-07-05"));

        let parsed: RecordDate = must(serde_json::from_value(value));
        assert_eq!(parsed, date("2025-07-05"));
    }

    #[test]
    fn record_date_rejects_impossible_days() {
        assert!(RecordDate::parse("2025-02-30").is_err());
        assert!(RecordDate::parse("07/05/2025").is_err());
    }

    #[test]
    fn segments_order_morning_afternoon_evening() {
        let mut segments = vec![
            TimeSegment::Evening,
            TimeSegment::Morning,
            TimeSegment::Afternoon,
        ];
        segments.sort();
        assert_eq!(segments, TimeSegment::ALL.to_vec());
        assert_eq!(TimeSegment::parse("afternoon"), Some(TimeSegment::Afternoon));
        assert_eq!(TimeSegment::parse("night"), None);
    }

    #[test]
    fn week_range_runs_monday_to_sunday() {
        // 2025-07-05 is a Saturday.
        let week = must(DateRange::week_containing(date("2025-07-05")));
        assert_eq!(week.from, date("2025-06-30"));
        assert_eq!(week.to, date("2025-07-06"));
        assert_eq!(week.label(), "2025-06-30_2025-07-06");
    }

    #[test]
    fn month_range_handles_leap_february() {
        let month = must(DateRange::month_containing(date("2024-02-11")));
        assert_eq!(month.from, date("2024-02-01"));
        assert_eq!(month.to, date("2024-02-29"));
    }

    #[test]
    fn range_rejects_inverted_bounds() {
        assert!(DateRange::new(date("2025-07-06"), date("2025-07-05")).is_err());
        let single = DateRange::single(date("2025-07-05"));
        assert_eq!(single.label(), "2025-07-05");
        assert!(single.contains(date("2025-07-05")));
        assert!(!single.contains(date("2025-07-06")));
    }

    #[test]
    fn spanning_covers_min_and_max() {
        let range = DateRange::spanning([date("2025-07-03"), date("2025-07-01"), date("2025-07-09")]);
        assert_eq!(
            range,
            Some(DateRange {
                from: date("2025-07-01"),
                to: date("2025-07-09"),
            })
        );
        assert_eq!(DateRange::spanning(Vec::new()), None);
    }

    #[test]
    fn trailing_days_includes_today() {
        let range = must(DateRange::trailing_days(date("2025-07-05"), 7));
        assert_eq!(range.from, date("2025-06-29"));
        assert_eq!(range.to, date("2025-07-05"));
        assert!(DateRange::trailing_days(date("2025-07-05"), 0).is_err());
    }

    #[test]
    fn manual_clock_advances_only_on_request() {
        let start = must(parse_rfc3339_utc("2025-07-05T08:00:00Z"));
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::hours(20));
        assert_eq!(clock.today(), date("2025-07-06"));
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc() {
        assert!(parse_rfc3339_utc("2025-07-05T08:00:00+09:00").is_err());
    }
}

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{DateRange, RecordDate, RecordKey, SyncError, TimeSegment};

/// Record as delivered by the remote system of record. `fields` is left as
/// raw JSON so schema problems surface per record during reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalRecord {
    pub source_id: String,
    pub date: RecordDate,
    pub time_segment: TimeSegment,
    pub fields: Map<String, Value>,
}

const ENVELOPE_KEYS: [&str; 4] = ["source_id", "id", "date", "time_segment"];

impl ExternalRecord {
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            date: self.date,
            time_segment: self.time_segment,
        }
    }

    /// Reads one exported entry. Payload fields may be nested under
    /// `fields` or sit next to the envelope keys.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the entry has no usable key.
    pub fn from_json(index: usize, value: &Value) -> Result<Self, SyncError> {
        let Value::Object(entry) = value else {
            return Err(SyncError::Validation(format!(
                "entry {index} MUST be a JSON object"
            )));
        };

        let source_id = entry
            .get("source_id")
            .or_else(|| entry.get("id"))
            .and_then(Value::as_str)
            .map_or_else(|| format!("entry-{index}"), str::to_string);

        let date = entry
            .get("date")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Validation(format!("entry {index} is missing date")))
            .and_then(RecordDate::parse)?;

        let segment_raw = entry
            .get("time_segment")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SyncError::Validation(format!("entry {index} is missing time_segment"))
            })?;
        let time_segment = TimeSegment::parse(segment_raw).ok_or_else(|| {
            SyncError::Validation(format!(
                "entry {index} has unknown time_segment {segment_raw:?}"
            ))
        })?;

        let fields = match entry.get("fields") {
            Some(Value::Object(nested)) => nested.clone(),
            Some(_) => {
                return Err(SyncError::Validation(format!(
                    "entry {index} fields MUST be a JSON object"
                )))
            }
            None => entry
                .iter()
                .filter(|(name, _)| !ENVELOPE_KEYS.contains(&name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        };

        Ok(Self {
            source_id,
            date,
            time_segment,
            fields,
        })
    }
}

/// Pull-based boundary to the remote system of record.
pub trait RecordSource {
    fn name(&self) -> &str;

    /// Returns every record the source holds inside `range`.
    ///
    /// # Errors
    /// Returns [`SyncError::SourceUnavailable`] when the source cannot be queried.
    fn fetch(&self, range: DateRange) -> Result<Vec<ExternalRecord>, SyncError>;
}

/// In-memory source.
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    records: Vec<ExternalRecord>,
    failure: Option<String>,
}

impl StaticSource {
    #[must_use]
    pub fn new(name: impl Into<String>, records: Vec<ExternalRecord>) -> Self {
        Self {
            name: name.into(),
            records,
            failure: None,
        }
    }

    /// Source whose every fetch fails with `message`.
    #[must_use]
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
            failure: Some(message.into()),
        }
    }
}

impl RecordSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, range: DateRange) -> Result<Vec<ExternalRecord>, SyncError> {
        if let Some(message) = &self.failure {
            return Err(SyncError::SourceUnavailable(format!("{}: {message}", self.name)));
        }
        Ok(self
            .records
            .iter()
            .filter(|record| range.contains(record.date))
            .cloned()
            .collect())
    }
}

/// Reads a JSON export: either a top-level array of entries or an object
/// with the entries under `records`.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
    name: String,
}

impl JsonFileSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("json:{}", path.display());
        Self { path, name }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSource for JsonFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, range: DateRange) -> Result<Vec<ExternalRecord>, SyncError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|err| {
            SyncError::SourceUnavailable(format!(
                "failed to read {}: {err}",
                self.path.display()
            ))
        })?;
        let document: Value = serde_json::from_str(&raw).map_err(|err| {
            SyncError::SourceUnavailable(format!(
                "failed to parse {}: {err}",
                self.path.display()
            ))
        })?;

        let entries = match &document {
            Value::Array(entries) => entries,
            Value::Object(root) => match root.get("records") {
                Some(Value::Array(entries)) => entries,
                _ => {
                    return Err(SyncError::SourceUnavailable(format!(
                        "{} has no records array",
                        self.path.display()
                    )))
                }
            },
            _ => {
                return Err(SyncError::SourceUnavailable(format!(
                    "{} MUST contain a JSON array or object",
                    self.path.display()
                )))
            }
        };

        let mut records = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let record = ExternalRecord::from_json(index, entry).map_err(|err| {
                SyncError::SourceUnavailable(format!("{}: {err}", self.path.display()))
            })?;
            if range.contains(record.date) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{BackupType, RecordSchema, SyncError};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    pub daily_keep_days: u32,
    pub weekly_keep_days: u32,
    pub monthly_keep_days: u32,
    pub custom_keep_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily_keep_days: 7,
            weekly_keep_days: 30,
            monthly_keep_days: 365,
            custom_keep_days: 30,
        }
    }
}

impl RetentionConfig {
    #[must_use]
    pub fn keep_days(&self, backup_type: &BackupType) -> u32 {
        match backup_type {
            BackupType::Daily => self.daily_keep_days,
            BackupType::Weekly => self.weekly_keep_days,
            BackupType::Monthly => self.monthly_keep_days,
            BackupType::Custom(_) => self.custom_keep_days,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub backup_root: PathBuf,
    pub source_path: Option<PathBuf>,
    pub sync_lookback_days: u32,
    pub retention: RetentionConfig,
    pub schema: Option<RecordSchema>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./reflection_sync.sqlite3"),
            backup_root: PathBuf::from("./backups"),
            source_path: None,
            sync_lookback_days: 7,
            retention: RetentionConfig::default(),
            schema: None,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`SyncError::Configuration`] when any value is out of bounds.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.db_path.as_os_str().is_empty() {
            return Err(SyncError::Configuration("db_path MUST be non-empty".to_string()));
        }
        if self.backup_root.as_os_str().is_empty() {
            return Err(SyncError::Configuration(
                "backup_root MUST be non-empty".to_string(),
            ));
        }
        if !(1..=3660).contains(&self.sync_lookback_days) {
            return Err(SyncError::Configuration(
                "sync_lookback_days MUST be between 1 and 3660".to_string(),
            ));
        }
        for (name, days) in [
            ("daily_keep_days", self.retention.daily_keep_days),
            ("weekly_keep_days", self.retention.weekly_keep_days),
            ("monthly_keep_days", self.retention.monthly_keep_days),
            ("custom_keep_days", self.retention.custom_keep_days),
        ] {
            if days == 0 {
                return Err(SyncError::Configuration(format!("{name} MUST be >= 1")));
            }
        }
        if let Some(schema) = &self.schema {
            schema.validate()?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`SyncError::Configuration`] when JSON parsing or validation fails.
    pub fn from_json(raw: &str) -> Result<Self, SyncError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| SyncError::Configuration(format!("invalid engine config JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`SyncError::Configuration`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            SyncError::Configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    #[must_use]
    pub fn schema(&self) -> RecordSchema {
        self.schema.clone().unwrap_or_default()
    }
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
    fn empty_object_yields_defaults() {
        let config = must(EngineConfig::from_json("{}"));
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.retention.keep_days(&BackupType::Monthly), 365);
        assert_eq!(config.schema().schema_version, "reflection.v1");
    }

    #[test]
    fn partial_retention_overrides_keep_other_defaults() {
        let config = must(EngineConfig::from_json(
            r#"{"backup_root": "/srv/backups", "retention": {"daily_keep_days": 3}}"#,
        ));
        assert_eq!(config.backup_root, PathBuf::from("/srv/backups"));
        assert_eq!(config.retention.daily_keep_days, 3);
        assert_eq!(config.retention.weekly_keep_days, 30);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        for raw in [
            r#"{"sync_lookback_days": 0}"#,
            r#"{"retention": {"weekly_keep_days": 0}}"#,
            r#"{"schema": {"schema_version": "x", "fields": []}}"#,
            r#"{"unknown_key": true}"#,
            "not json",
        ] {
            assert!(
                matches!(EngineConfig::from_json(raw), Err(SyncError::Configuration(_))),
                "{raw}"
            );
        }
    }
}

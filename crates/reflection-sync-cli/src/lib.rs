//! Command surface for the reflection sync engine.
//!
//! Hosts can embed the same behavior as the `reflect-sync` binary through
//! [`run_cli`], which returns a [`CommandStatus`] instead of exiting.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use reflection_sync_core::{
    BackupType, Clock, DateRange, EngineConfig, IssueSeverity, JsonFileSource, RecordDate,
    SyncStatus, SystemClock,
};
use reflection_sync_store_sqlite::{RetentionManager, SnapshotManager, SqliteRecordStore};
use tracing::debug;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "reflect-sync")]
#[command(about = "Reflection record sync and backup engine")]
pub struct Cli {
    /// `SQLite` database holding records, snapshot metadata and the sync log.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory that receives snapshot artifacts.
    #[arg(long)]
    backup_root: Option<PathBuf>,

    /// JSON engine configuration; flags above take precedence.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Pull records from the source and reconcile them into the store.
    Sync(SyncArgs),
    /// Write a snapshot artifact for a date range.
    Backup(BackupArgs),
    /// Check a snapshot artifact against its stored metadata.
    Verify(SnapshotIdArgs),
    /// Replay a verified snapshot into a store.
    Restore(RestoreArgs),
    /// Delete snapshots older than the retention window.
    Cleanup(CleanupArgs),
    Snapshots {
        #[command(subcommand)]
        command: Box<SnapshotsCommand>,
    },
    Records {
        #[command(subcommand)]
        command: Box<RecordsCommand>,
    },
    Log {
        #[command(subcommand)]
        command: Box<LogCommand>,
    },
    /// Record and snapshot totals.
    Stats,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    #[arg(long, value_parser = RecordDate::parse)]
    since: Option<RecordDate>,
    #[arg(long, value_parser = RecordDate::parse, requires = "since")]
    until: Option<RecordDate>,
    /// JSON export of the remote source; defaults to `source_path` from config.
    #[arg(long)]
    source: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct BackupArgs {
    #[arg(long = "type", value_parser = BackupType::parse)]
    backup_type: BackupType,
    #[arg(long, value_parser = RecordDate::parse, conflicts_with_all = ["from", "to"])]
    date: Option<RecordDate>,
    #[arg(long, value_parser = RecordDate::parse, requires = "to")]
    from: Option<RecordDate>,
    #[arg(long, value_parser = RecordDate::parse, requires = "from")]
    to: Option<RecordDate>,
}

#[derive(Debug, Args)]
pub struct SnapshotIdArgs {
    #[arg(value_parser = Ulid::from_string)]
    snapshot_id: Ulid,
}

#[derive(Debug, Args)]
pub struct RestoreArgs {
    #[arg(value_parser = Ulid::from_string)]
    snapshot_id: Ulid,
    /// Store to restore into; defaults to the main database.
    #[arg(long)]
    target_db: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CleanupArgs {
    #[arg(long = "type", value_parser = BackupType::parse)]
    backup_type: BackupType,
    /// Overrides the configured retention for this class.
    #[arg(long)]
    keep_days: Option<u32>,
}

#[derive(Debug, Subcommand)]
pub enum SnapshotsCommand {
    List(SnapshotsListArgs),
}

#[derive(Debug, Args)]
pub struct SnapshotsListArgs {
    #[arg(long = "type", value_parser = BackupType::parse)]
    backup_type: Option<BackupType>,
}

#[derive(Debug, Subcommand)]
pub enum RecordsCommand {
    List(RecordsListArgs),
}

#[derive(Debug, Args)]
pub struct RecordsListArgs {
    #[arg(long, value_parser = RecordDate::parse)]
    from: RecordDate,
    #[arg(long, value_parser = RecordDate::parse)]
    to: RecordDate,
}

#[derive(Debug, Subcommand)]
pub enum LogCommand {
    List(LogListArgs),
}

#[derive(Debug, Args)]
pub struct LogListArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

/// Outcome of a command that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    /// Completed, but some records failed or an artifact did not verify.
    Partial,
}

impl CommandStatus {
    #[must_use]
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Partial => 2,
        }
    }
}

struct Session {
    config: EngineConfig,
    clock: SystemClock,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration, store access or the requested
/// command fails before producing a result.
pub fn run_cli(cli: Cli) -> Result<CommandStatus> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(backup_root) = cli.backup_root {
        config.backup_root = backup_root;
    }
    config.validate()?;
    debug!(db = %config.db_path.display(), backup_root = %config.backup_root.display(), "resolved engine config");

    let session = Session {
        config,
        clock: SystemClock,
    };
    let mut store = open_store(&session, &session.config.db_path)?;

    match cli.command {
        Command::Sync(args) => run_sync(&session, &mut store, args),
        Command::Backup(args) => run_backup(&session, &store, args),
        Command::Verify(args) => {
            let snapshot = store.get_snapshot(args.snapshot_id)?;
            let report = SnapshotManager::new(&session.config.backup_root).verify_snapshot(&snapshot);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.verified {
                Ok(CommandStatus::Success)
            } else {
                for issue in &report.issues {
                    let severity = match issue.severity {
                        IssueSeverity::Warning => "warning",
                        IssueSeverity::Error => "error",
                    };
                    eprintln!("{severity}:{}:{}", issue.code, issue.message);
                }
                Ok(CommandStatus::Partial)
            }
        }
        Command::Restore(args) => {
            let snapshot = store.get_snapshot(args.snapshot_id)?;
            let manager = SnapshotManager::new(&session.config.backup_root);
            let result = match &args.target_db {
                Some(path) => {
                    let mut target = open_store(&session, path)?;
                    manager.restore_into_store(&snapshot, &mut target)?
                }
                None => manager.restore_into_store(&snapshot, &mut store)?,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(status_of(result.status))
        }
        Command::Cleanup(args) => {
            let keep_days = args
                .keep_days
                .unwrap_or_else(|| session.config.retention.keep_days(&args.backup_type));
            let report = RetentionManager::new(&session.config.backup_root).cleanup(
                &store,
                &args.backup_type,
                keep_days,
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.errors.is_empty() {
                Ok(CommandStatus::Success)
            } else {
                Ok(CommandStatus::Partial)
            }
        }
        Command::Snapshots { command } => match *command {
            SnapshotsCommand::List(args) => {
                let snapshots = store.list_snapshots(args.backup_type.as_ref())?;
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
                Ok(CommandStatus::Success)
            }
        },
        Command::Records { command } => match *command {
            RecordsCommand::List(args) => {
                let range = DateRange::new(args.from, args.to)?;
                let records = store.get_range(range)?;
                println!("{}", serde_json::to_string_pretty(&records)?);
                Ok(CommandStatus::Success)
            }
        },
        Command::Log { command } => match *command {
            LogCommand::List(args) => {
                let entries = store.list_sync_log(args.limit)?;
                println!("{}", serde_json::to_string_pretty(&entries)?);
                Ok(CommandStatus::Success)
            }
        },
        Command::Stats => {
            let stats = store.backup_statistics()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(CommandStatus::Success)
        }
    }
}

fn open_store(session: &Session, path: &std::path::Path) -> Result<SqliteRecordStore> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = SqliteRecordStore::open(path)?.with_schema(session.config.schema())?;
    store.migrate()?;
    Ok(store)
}

fn run_sync(session: &Session, store: &mut SqliteRecordStore, args: SyncArgs) -> Result<CommandStatus> {
    let source_path = args
        .source
        .or_else(|| session.config.source_path.clone())
        .ok_or_else(|| anyhow!("no source configured: pass --source or set source_path in --config"))?;

    let today = session.clock.today();
    let range = match args.since {
        Some(since) => DateRange::new(since, args.until.unwrap_or(today))?,
        None => DateRange::trailing_days(today, session.config.sync_lookback_days)?,
    };

    let source = JsonFileSource::new(source_path);
    let result = store.sync(&source, range)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(status_of(result.status))
}

fn run_backup(session: &Session, store: &SqliteRecordStore, args: BackupArgs) -> Result<CommandStatus> {
    let range = match (args.date, args.from, args.to) {
        (Some(date), _, _) => DateRange::single(date),
        (None, Some(from), Some(to)) => DateRange::new(from, to)?,
        _ => args.backup_type.default_range(session.clock.today())?,
    };
    let snapshot = SnapshotManager::new(&session.config.backup_root).create_snapshot(
        store,
        &args.backup_type,
        range,
    )?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(CommandStatus::Success)
}

fn status_of(status: SyncStatus) -> CommandStatus {
    match status {
        SyncStatus::Success => CommandStatus::Success,
        SyncStatus::PartialSuccess | SyncStatus::Failed => CommandStatus::Partial,
    }
}

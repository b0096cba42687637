//! CLI command implementations.

pub mod jobs;
pub mod maintenance;
pub mod run;
pub mod tables;

use clap::{Args, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tablesync_engine::{EngineConfig, SqliteStore, SqliteWarehouse, SyncService};
use tablesync_ledger::SqliteLedger;
use tablesync_types::SourceTableRef;

/// Result type shared by all commands.
pub type CommandResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Output format of read commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable lines.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Locations of the data systems a service needs.
#[derive(Debug, Clone, Args)]
pub struct DataArgs {
    /// SQLite database standing in for the source warehouse (opened read-only)
    #[arg(long, env = "TABLESYNC_SOURCE")]
    pub source: PathBuf,

    /// SQLite destination store
    #[arg(
        long,
        env = "TABLESYNC_DESTINATION",
        default_value = "tablesync/destination.db"
    )]
    pub destination: PathBuf,

    /// Root directory for staged files
    #[arg(long, env = "TABLESYNC_STAGING", default_value = "tablesync/staging")]
    pub staging: PathBuf,

    /// Maximum rows per export chunk
    #[arg(long, default_value = "10000")]
    pub chunk_size: usize,
}

impl DataArgs {
    /// Engine configuration for these locations.
    pub fn config(&self) -> EngineConfig {
        EngineConfig::new(&self.staging).with_chunk_size(self.chunk_size)
    }
}

/// Opens the ledger, creating it if needed.
pub fn open_ledger(path: &Path) -> CommandResult<Arc<SqliteLedger>> {
    Ok(Arc::new(SqliteLedger::open(path)?))
}

/// Builds a stopped service over the given ledger and data systems.
pub fn build_service(
    ledger: &Path,
    data: &DataArgs,
    config: EngineConfig,
) -> CommandResult<SyncService> {
    let ledger = open_ledger(ledger)?;
    let source = SqliteWarehouse::open(&data.source)?;
    if let Some(parent) = data.destination.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let destination = SqliteStore::open(&data.destination)?;
    Ok(SyncService::new(
        config,
        ledger,
        Arc::new(source),
        Arc::new(destination),
    ))
}

/// Builds a table reference from CLI arguments.
pub fn table_ref(schema: &str, table: &str) -> SourceTableRef {
    SourceTableRef::new(schema, table)
}

/// Prints `value` as JSON, or through `text` in text mode.
pub fn emit<T: Serialize>(format: Format, value: &T, text: impl FnOnce(&T)) -> CommandResult {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Format::Text => text(value),
    }
    Ok(())
}

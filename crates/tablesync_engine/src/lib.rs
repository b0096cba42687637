//! # tablesync engine
//!
//! Replicates tables from a remote columnar warehouse into a local
//! analytical store.
//!
//! This crate provides:
//! - Type mapping from source to destination column types
//! - Additive schema reconciliation
//! - The batch transporter (export → stage → load → verify → clean)
//! - Retry supervision with transient/fatal classification
//! - A worker pool running each job's pipeline end to end
//! - The stale job reaper and the retention sweeper
//! - [`SyncService`], the facade tying these to a [`tablesync_ledger::JobLedger`]
//!
//! ## Pipeline
//!
//! ```text
//! submit ─→ ledger.create (Pending)
//!              │
//!   worker ─→ Running ─→ fetch schema ─→ ensure destination ─→ transport ─→ Completed
//!                              └────────────────┴─────────────────┴──────→ Failed
//! ```
//!
//! Schema and transport steps run under the sync retry budget; status and
//! statistics queries under the lightweight one.
//!
//! ## Key Invariants
//!
//! - At most one active job per table, enforced by the ledger
//! - Destination schemas only grow; columns are never dropped or retyped
//! - Staged files and source exports are released on every path
//! - Every failure message reaches the job record verbatim
//! - A full sync deletes before loading; readers may observe the gap

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod destination;
mod error;
mod periodic;
mod reaper;
mod retry;
mod schema;
mod service;
mod source;
mod sqlite_source;
mod staging;
mod sweeper;
mod transport;
mod type_map;
mod worker;

pub use config::{EngineConfig, ReaperConfig, RetentionConfig, RetryConfig};
pub use destination::{DestinationStore, ExistingColumn, SqliteStore};
pub use error::{ErrorClass, SyncError, SyncResult};
pub use periodic::PeriodicTask;
pub use reaper::StaleJobReaper;
pub use retry::{RetryClass, RetrySupervisor};
pub use schema::{SchemaChange, SchemaReconciler};
pub use service::SyncService;
pub use source::{ExportCursor, ExportRequest, MemoryWarehouse, SourceWarehouse};
pub use sqlite_source::SqliteWarehouse;
pub use staging::{
    arrow_schema, arrow_type, StagedFile, StagedReader, StagedWriter, StagingArea, StagingEntry,
};
pub use sweeper::{RetentionSweeper, SweepReport};
pub use transport::{BatchTransporter, TransportOutcome, TransportPhase, TransportPlan};
pub use type_map::{map_column, map_columns, map_type, parse_source_type};
pub use worker::{SyncWorker, WorkerPool};

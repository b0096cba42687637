//! # tablesync types
//!
//! Data model shared by the job ledger and the sync engine.
//!
//! This crate provides:
//! - Table references and the registration record
//! - Source and destination column descriptors
//! - Row values, rows, and row predicates
//! - Sync jobs, their status machine, and per-table sync status
//!
//! ## Key Invariants
//!
//! - Column order is significant and preserved end-to-end
//! - A job's legal transitions are `Pending → Running → Completed | Failed`
//! - A terminal job is immutable
//! - A table's watermark only advances

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod column;
mod job;
mod table;
mod value;

pub use column::{ColumnDescriptor, DestinationType, SourceColumn, SourceType, TypeFamily};
pub use job::{
    JobId, JobStats, JobStatus, ParseStatusError, StatsUpdate, SyncJob, SyncRequest, SyncStrategy,
    TableSyncStatus,
};
pub use table::{RegisteredTable, SourceTableRef, TableStats};
pub use value::{Predicate, Row, Value};

//! # tablesync ledger
//!
//! Durable record store for sync jobs and per-table sync status.
//!
//! The ledger is the single source of truth for "what state is this job in".
//! It is the only shared mutable state of the engine; workers, the stale
//! job reaper and the retention sweeper all go through its atomic operations.
//!
//! ## Guarantees
//!
//! - At most one active (`Pending` or `Running`) job per table
//! - Only `Pending → Running → Completed | Failed` transitions are accepted
//! - A job's terminal transition and its table's status row commit together
//! - A table's watermark never regresses
//!
//! ## Example
//!
//! ```rust
//! use tablesync_ledger::{JobLedger, SqliteLedger, TransitionFields};
//! use tablesync_types::{JobStatus, SourceTableRef, SyncRequest};
//!
//! let ledger = SqliteLedger::in_memory().unwrap();
//! let job_id = ledger
//!     .create(&SyncRequest::full(SourceTableRef::new("sales", "orders")))
//!     .unwrap();
//! ledger
//!     .transition(job_id, JobStatus::Running, TransitionFields::none())
//!     .unwrap();
//! assert_eq!(ledger.get(job_id).unwrap().status, JobStatus::Running);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod ledger;
mod sqlite;

pub use error::{LedgerError, LedgerResult};
pub use ledger::{JobLedger, TransitionFields};
pub use sqlite::SqliteLedger;

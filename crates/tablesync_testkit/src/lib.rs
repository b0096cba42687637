//! # tablesync testkit
//!
//! Test utilities for tablesync.
//!
//! This crate provides:
//! - A harness wiring source, destination and ledger over temporary storage
//! - Fault-injecting source and destination wrappers
//! - Generated fixture tables
//! - Property-based test generators using proptest
//! - Polling helpers for asynchronous job completion
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tablesync_testkit::prelude::*;
//!
//! #[test]
//! fn flaky_export_recovers() {
//!     let harness = TestHarness::new();
//!     seed_orders(harness.warehouse(), 0..100);
//!     harness.source.fail_exports(2);
//!
//!     let service = harness.service();
//!     let job = service.sync_now(SyncRequest::full(orders_table())).unwrap();
//!     assert_eq!(job.status, JobStatus::Completed);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use tablesync_types::{JobStatus, SyncRequest};
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;

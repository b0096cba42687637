//! Fault-injecting wrappers around sources and destinations.
//!
//! Each wrapper delegates to an inner implementation and fails the next
//! `n` calls of a chosen operation. Failure messages are numbered so tests
//! can tell which attempt's error ended up on the job record.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use tablesync_engine::{
    DestinationStore, ExistingColumn, ExportCursor, ExportRequest, SourceWarehouse, SyncError,
    SyncResult,
};
use tablesync_types::{ColumnDescriptor, SourceColumn, SourceTableRef, TableStats};

/// Kind of error a wrapper injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// [`SyncError::SourceUnavailable`] (transient).
    Unavailable,
    /// [`SyncError::Timeout`] (transient).
    Timeout,
    /// [`SyncError::LockContention`] (transient).
    Contention,
    /// [`SyncError::AuthenticationFailed`] (fatal).
    Authentication,
}

impl Fault {
    fn error(self, operation: &str, n: u32) -> SyncError {
        let message = format!("{operation} failure {n}");
        match self {
            Fault::Unavailable => SyncError::SourceUnavailable(message),
            Fault::Timeout => SyncError::Timeout(message),
            Fault::Contention => SyncError::LockContention(message),
            Fault::Authentication => SyncError::AuthenticationFailed(message),
        }
    }
}

/// A budget of upcoming failures for one operation.
#[derive(Debug, Default)]
struct Trigger {
    remaining: AtomicU32,
    injected: AtomicU32,
    calls: AtomicU32,
}

impl Trigger {
    fn arm(&self, n: u32) {
        self.remaining.store(n, Ordering::SeqCst);
    }

    /// Records a call; returns the failure number if this call should fail.
    fn fire(&self) -> Option<u32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| self.injected.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// A source that fails a configurable number of calls before delegating.
#[derive(Debug)]
pub struct FlakySource<S> {
    inner: S,
    fault: Fault,
    describe: Trigger,
    export: Trigger,
    stats: Trigger,
}

impl<S: SourceWarehouse> FlakySource<S> {
    /// Wraps `inner`; no failures are armed.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fault: Fault::Unavailable,
            describe: Trigger::default(),
            export: Trigger::default(),
            stats: Trigger::default(),
        }
    }

    /// Sets the injected error kind.
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    /// The wrapped source.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fails the next `n` exports.
    pub fn fail_exports(&self, n: u32) {
        self.export.arm(n);
    }

    /// Fails the next `n` schema lookups.
    pub fn fail_describes(&self, n: u32) {
        self.describe.arm(n);
    }

    /// Fails the next `n` statistics queries.
    pub fn fail_stats(&self, n: u32) {
        self.stats.arm(n);
    }

    /// Exports attempted so far, failed or not.
    pub fn export_calls(&self) -> u32 {
        self.export.calls()
    }

    /// Schema lookups attempted so far.
    pub fn describe_calls(&self) -> u32 {
        self.describe.calls()
    }
}

impl<S: SourceWarehouse> SourceWarehouse for FlakySource<S> {
    fn describe_table(&self, table: &SourceTableRef) -> SyncResult<Vec<SourceColumn>> {
        if let Some(n) = self.describe.fire() {
            return Err(self.fault.error("describe", n));
        }
        self.inner.describe_table(table)
    }

    fn open_export(&self, request: &ExportRequest) -> SyncResult<Box<dyn ExportCursor>> {
        if let Some(n) = self.export.fire() {
            return Err(self.fault.error("export", n));
        }
        self.inner.open_export(request)
    }

    fn table_stats(&self, table: &SourceTableRef) -> SyncResult<TableStats> {
        if let Some(n) = self.stats.fire() {
            return Err(self.fault.error("stats", n));
        }
        self.inner.table_stats(table)
    }
}

/// A destination that can drop loads or report contention.
#[derive(Debug)]
pub struct FaultyStore<D> {
    inner: D,
    short_loads: Trigger,
    busy_loads: Trigger,
}

impl<D: DestinationStore> FaultyStore<D> {
    /// Wraps `inner`; no faults are armed.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            short_loads: Trigger::default(),
            busy_loads: Trigger::default(),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// The next `n` loads report success without inserting anything, so
    /// post-load verification fails.
    pub fn short_loads(&self, n: u32) {
        self.short_loads.arm(n);
    }

    /// The next `n` loads fail with lock contention.
    pub fn busy_loads(&self, n: u32) {
        self.busy_loads.arm(n);
    }

    /// Loads attempted so far.
    pub fn load_calls(&self) -> u32 {
        self.busy_loads.calls()
    }
}

impl<D: DestinationStore> DestinationStore for FaultyStore<D> {
    fn existing_columns(&self, table: &SourceTableRef) -> SyncResult<Option<Vec<ExistingColumn>>> {
        self.inner.existing_columns(table)
    }

    fn create_table(&self, table: &SourceTableRef, columns: &[ColumnDescriptor]) -> SyncResult<()> {
        self.inner.create_table(table, columns)
    }

    fn add_column(&self, table: &SourceTableRef, column: &ColumnDescriptor) -> SyncResult<()> {
        self.inner.add_column(table, column)
    }

    fn delete_all(&self, table: &SourceTableRef) -> SyncResult<u64> {
        self.inner.delete_all(table)
    }

    fn bulk_load(&self, table: &SourceTableRef, staged: &Path) -> SyncResult<u64> {
        if let Some(n) = self.busy_loads.fire() {
            return Err(Fault::Contention.error("load", n));
        }
        if self.short_loads.fire().is_some() {
            return Ok(0);
        }
        self.inner.bulk_load(table, staged)
    }

    fn row_count(&self, table: &SourceTableRef) -> SyncResult<u64> {
        self.inner.row_count(table)
    }
}

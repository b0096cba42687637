//! Test fixtures: a wired-up engine over temporary storage.

use crate::faults::{Fault, FaultyStore, FlakySource};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tablesync_engine::{EngineConfig, MemoryWarehouse, RetryConfig, SqliteStore, SyncService};
use tablesync_ledger::SqliteLedger;
use tablesync_types::{JobId, Row, SourceColumn, SourceTableRef, SyncJob, Value};
use tempfile::TempDir;

/// A retry budget with no delays, for fast tests.
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::new(max_retries)
        .with_initial_delay(Duration::ZERO)
        .with_max_delay(Duration::ZERO)
        .with_jitter(false)
}

/// Source, destination and ledger over a temporary directory.
///
/// The source is an in-memory warehouse behind a [`FlakySource`]; the
/// destination is a file-backed SQLite store behind a [`FaultyStore`].
pub struct TestHarness {
    /// Fault-injecting source.
    pub source: Arc<FlakySource<MemoryWarehouse>>,
    /// Fault-injecting destination.
    pub destination: Arc<FaultyStore<SqliteStore>>,
    /// File-backed ledger.
    pub ledger: Arc<SqliteLedger>,
    /// Engine configuration used by [`TestHarness::service`].
    pub config: EngineConfig,
    /// The temporary directory (kept alive to prevent cleanup).
    dir: TempDir,
}

impl TestHarness {
    /// Creates a harness with two workers and instant retries
    /// (3 sync retries, 1 lightweight retry).
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Creates a harness, letting `configure` adjust the default test config.
    pub fn with_config(configure: impl FnOnce(EngineConfig) -> EngineConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let config = configure(
            EngineConfig::new(dir.path().join("staging"))
                .with_workers(2)
                .with_chunk_size(1_000)
                .with_sync_retry(fast_retry(3))
                .with_lightweight_retry(fast_retry(1)),
        );
        let ledger = SqliteLedger::open(&dir.path().join("ledger.db"))
            .expect("Failed to open ledger");
        let destination = SqliteStore::open(&dir.path().join("destination.db"))
            .expect("Failed to open destination");

        Self {
            source: Arc::new(FlakySource::new(MemoryWarehouse::new())),
            destination: Arc::new(FaultyStore::new(destination)),
            ledger: Arc::new(ledger),
            config,
            dir,
        }
    }

    /// Replaces the source with an empty warehouse that injects `fault`.
    pub fn with_source_fault(mut self, fault: Fault) -> Self {
        self.source = Arc::new(FlakySource::new(MemoryWarehouse::new()).with_fault(fault));
        self
    }

    /// The in-memory warehouse behind the flaky source.
    pub fn warehouse(&self) -> &MemoryWarehouse {
        self.source.inner()
    }

    /// The SQLite store behind the faulty destination.
    pub fn store(&self) -> &SqliteStore {
        self.destination.inner()
    }

    /// The temporary directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The staging root.
    pub fn staging_dir(&self) -> PathBuf {
        self.config.staging_dir.clone()
    }

    /// Builds a (stopped) service over the harness components.
    pub fn service(&self) -> SyncService {
        SyncService::new(
            self.config.clone(),
            self.ledger.clone(),
            self.source.clone(),
            self.destination.clone(),
        )
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// The reference table used across scenarios.
pub fn orders_table() -> SourceTableRef {
    SourceTableRef::new("sales", "orders")
}

/// Columns of the orders table.
pub fn orders_columns() -> Vec<SourceColumn> {
    vec![
        SourceColumn::new("ID", "NUMBER(38,0)").not_null().with_precision(38, 0),
        SourceColumn::new("CUSTOMER", "VARCHAR(64)").with_max_length(64),
        SourceColumn::new("AMOUNT", "NUMBER(12,2)").with_precision(12, 2),
        SourceColumn::new("PAID", "BOOLEAN"),
        SourceColumn::new("ORDER_DATE", "DATE"),
        SourceColumn::new("UPDATED_AT", "TIMESTAMP_NTZ"),
    ]
}

/// The base `UPDATED_AT` of generated orders.
pub fn base_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("valid base time")
}

/// `UPDATED_AT` of the order with the given ID: one minute apart.
pub fn updated_at(id: u32) -> NaiveDateTime {
    base_time() + TimeDelta::minutes(i64::from(id))
}

/// One generated order row.
pub fn order_row(id: u32) -> Row {
    let updated = updated_at(id);
    vec![
        Value::Number(f64::from(id)),
        Value::Text(format!("customer-{}", id % 97)),
        Value::Number(f64::from(id % 1_000) + 0.25),
        Value::Boolean(id % 2 == 0),
        Value::Date(updated.date()),
        Value::Timestamp(updated),
    ]
}

/// Creates the orders table in `warehouse` with IDs in `ids`.
pub fn seed_orders(warehouse: &MemoryWarehouse, ids: std::ops::Range<u32>) {
    warehouse.create_table(orders_table(), orders_columns());
    append_orders(warehouse, ids);
}

/// Appends orders with IDs in `ids`.
pub fn append_orders(warehouse: &MemoryWarehouse, ids: std::ops::Range<u32>) {
    warehouse
        .insert_rows(&orders_table(), ids.map(order_row))
        .expect("Failed to insert orders");
}

/// Polls until the job reaches a terminal state.
///
/// # Panics
///
/// Panics if the job is still active after `timeout`.
pub fn wait_for_terminal(service: &SyncService, job_id: JobId, timeout: Duration) -> SyncJob {
    let deadline = Instant::now() + timeout;
    loop {
        let job = service.status(job_id).expect("Failed to read job");
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {job_id} still {} after {timeout:?}",
            job.status
        );
        thread::sleep(Duration::from_millis(10));
    }
}

//! The batch transporter: one export, stage, load and verify pass.
//!
//! ## Phases
//!
//! ```text
//! Exporting → Staged → Loading → Verified → Cleaned
//!     └──────────┴─────────┴─────────┴──→ Failed
//! ```
//!
//! The staged file and the source export are released on every path. A pass
//! that fails anywhere is retried from the start by the caller; there is no
//! partial resume.

use crate::destination::DestinationStore;
use crate::error::{SyncError, SyncResult};
use crate::source::{column_index, ExportCursor, ExportRequest, SourceWarehouse};
use crate::staging::{StagedFile, StagedWriter, StagingArea};
use std::fmt;
use std::sync::Arc;
use tablesync_ledger::JobLedger;
use tablesync_types::{
    ColumnDescriptor, JobId, Predicate, SourceTableRef, StatsUpdate, SyncStrategy, Value,
};
use tracing::{debug, info, warn};

/// A phase of one transport pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPhase {
    /// Rows are being read from the source into the staged file.
    Exporting,
    /// The staged file is complete.
    Staged,
    /// The staged file is being loaded into the destination.
    Loading,
    /// The destination row count matched the export.
    Verified,
    /// Staged file and source export were released.
    Cleaned,
    /// The pass failed.
    Failed,
}

impl fmt::Display for TransportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportPhase::Exporting => "exporting",
            TransportPhase::Staged => "staged",
            TransportPhase::Loading => "loading",
            TransportPhase::Verified => "verified",
            TransportPhase::Cleaned => "cleaned",
            TransportPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Inputs of one transport pass.
#[derive(Debug, Clone)]
pub struct TransportPlan {
    /// Table to move.
    pub table_ref: SourceTableRef,
    /// Mapped columns, in order.
    pub columns: Vec<ColumnDescriptor>,
    /// Sync strategy.
    pub strategy: SyncStrategy,
    /// Explicit row filter.
    pub filter: Option<Predicate>,
    /// Watermark of the last successful incremental sync.
    pub last_watermark: Option<Value>,
}

impl TransportPlan {
    /// The filter sent to the source: the explicit filter AND-ed with
    /// `watermark_column > last_watermark` for incremental syncs.
    pub fn export_filter(&self) -> Option<Predicate> {
        let watermark = match (self.strategy.watermark_column(), &self.last_watermark) {
            (Some(column), Some(value)) => Some(Predicate::gt(column, value.clone())),
            _ => None,
        };
        match (self.filter.clone(), watermark) {
            (Some(filter), Some(watermark)) => Some(filter.and(watermark)),
            (filter, watermark) => filter.or(watermark),
        }
    }
}

/// Result of a successful pass.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOutcome {
    /// Rows written to the staged file.
    pub exported_rows: u64,
    /// Rows inserted by the bulk load.
    pub loaded_rows: u64,
    /// Size of the staged file.
    pub bytes: u64,
    /// Highest non-null watermark among exported rows.
    pub watermark: Option<Value>,
    /// Phases passed through, in order.
    pub phases: Vec<TransportPhase>,
}

struct Export {
    rows: u64,
    watermark: Option<Value>,
}

/// Moves rows from the source into the destination through a staged file.
pub struct BatchTransporter {
    source: Arc<dyn SourceWarehouse>,
    destination: Arc<dyn DestinationStore>,
    ledger: Arc<dyn JobLedger>,
    staging: StagingArea,
    chunk_size: usize,
}

impl BatchTransporter {
    /// Creates a transporter.
    pub fn new(
        source: Arc<dyn SourceWarehouse>,
        destination: Arc<dyn DestinationStore>,
        ledger: Arc<dyn JobLedger>,
        staging: StagingArea,
        chunk_size: usize,
    ) -> Self {
        Self {
            source,
            destination,
            ledger,
            staging,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Runs one pass for a running job.
    pub fn run(
        &self,
        job_id: JobId,
        attempt: u32,
        plan: &TransportPlan,
    ) -> SyncResult<TransportOutcome> {
        let mut phases = Vec::new();
        self.run_logged(job_id, attempt, plan, &mut phases)
    }

    /// Like [`BatchTransporter::run`], recording phases into `phases` even
    /// when the pass fails.
    pub fn run_logged(
        &self,
        job_id: JobId,
        attempt: u32,
        plan: &TransportPlan,
        phases: &mut Vec<TransportPhase>,
    ) -> SyncResult<TransportOutcome> {
        let staged = self.staging.stage(job_id, attempt)?;
        let result = self.transfer(job_id, plan, &staged, phases);
        let cleaned = staged.cleanup();

        match result {
            Ok(mut outcome) => {
                cleaned?;
                enter(phases, job_id, TransportPhase::Cleaned);
                outcome.phases = phases.clone();
                Ok(outcome)
            }
            Err(e) => {
                if let Err(cleanup_err) = cleaned {
                    warn!(job_id = %job_id, error = %cleanup_err, "failed to remove staged file");
                }
                enter(phases, job_id, TransportPhase::Failed);
                Err(e)
            }
        }
    }

    fn transfer(
        &self,
        job_id: JobId,
        plan: &TransportPlan,
        staged: &StagedFile,
        phases: &mut Vec<TransportPhase>,
    ) -> SyncResult<TransportOutcome> {
        enter(phases, job_id, TransportPhase::Exporting);
        let export = self.export(job_id, plan, staged)?;
        let bytes = staged.size()?;

        enter(phases, job_id, TransportPhase::Staged);
        self.ledger.update_stats(
            job_id,
            &StatsUpdate::default()
                .rows_processed(0)
                .total_rows(export.rows)
                .bytes(bytes),
        )?;

        enter(phases, job_id, TransportPhase::Loading);
        let table = &plan.table_ref;
        let baseline = match plan.strategy {
            SyncStrategy::Full => {
                let deleted = self.destination.delete_all(table)?;
                debug!(job_id = %job_id, table = %table, deleted, "destination cleared");
                0
            }
            SyncStrategy::Incremental { .. } => self.destination.row_count(table)?,
        };
        let loaded = self.destination.bulk_load(table, staged.path())?;

        let expected = baseline + export.rows;
        let actual = self.destination.row_count(table)?;
        if actual != expected {
            return Err(SyncError::VerificationFailed { expected, actual });
        }
        enter(phases, job_id, TransportPhase::Verified);
        self.ledger
            .update_stats(job_id, &StatsUpdate::default().rows_processed(export.rows))?;

        info!(
            job_id = %job_id,
            table = %table,
            rows = export.rows,
            bytes,
            "batch transported"
        );
        Ok(TransportOutcome {
            exported_rows: export.rows,
            loaded_rows: loaded,
            bytes,
            watermark: export.watermark,
            phases: Vec::new(),
        })
    }

    fn export(&self, job_id: JobId, plan: &TransportPlan, staged: &StagedFile) -> SyncResult<Export> {
        let names: Vec<String> = plan.columns.iter().map(|c| c.name.clone()).collect();
        let watermark_idx = match plan.strategy.watermark_column() {
            Some(column) => Some(column_index(&names, column).ok_or_else(|| {
                SyncError::InvalidRequest(format!(
                    "watermark column {column} not found in {}",
                    plan.table_ref
                ))
            })?),
            None => None,
        };

        let request = ExportRequest {
            table_ref: plan.table_ref.clone(),
            columns: names,
            filter: plan.export_filter(),
            chunk_size: self.chunk_size,
        };
        let mut cursor = self.source.open_export(&request)?;
        let result = self.drain(job_id, cursor.as_mut(), plan, staged, watermark_idx);
        let released = cursor.release();
        let export = result?;
        released?;
        Ok(export)
    }

    fn drain(
        &self,
        job_id: JobId,
        cursor: &mut dyn ExportCursor,
        plan: &TransportPlan,
        staged: &StagedFile,
        watermark_idx: Option<usize>,
    ) -> SyncResult<Export> {
        let mut writer = StagedWriter::create(staged.path(), &plan.columns)?;
        let mut watermark: Option<Value> = None;

        while let Some(chunk) = cursor.next_chunk()? {
            if let Some(idx) = watermark_idx {
                for value in chunk.iter().filter_map(|row| row.get(idx)) {
                    if value.is_null() {
                        continue;
                    }
                    if watermark.as_ref().map_or(true, |max| value.is_after(max)) {
                        watermark = Some(value.clone());
                    }
                }
            }
            writer.write_chunk(&chunk)?;
            // Heartbeat for the reaper.
            self.ledger.update_stats(job_id, &StatsUpdate::heartbeat())?;
        }

        let rows = writer.finish()?;
        Ok(Export { rows, watermark })
    }
}

fn enter(phases: &mut Vec<TransportPhase>, job_id: JobId, phase: TransportPhase) {
    debug!(job_id = %job_id, phase = %phase, "transport phase");
    phases.push(phase);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::SqliteStore;
    use crate::source::MemoryWarehouse;
    use crate::type_map::map_columns;
    use chrono::NaiveDateTime;
    use tablesync_ledger::{SqliteLedger, TransitionFields};
    use tablesync_types::{JobStatus, SourceColumn, SyncRequest};
    use tempfile::TempDir;

    fn orders() -> SourceTableRef {
        SourceTableRef::new("sales", "orders")
    }

    fn ts(s: &str) -> Value {
        Value::Timestamp(NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap())
    }

    fn source_columns() -> Vec<SourceColumn> {
        vec![
            SourceColumn::new("ID", "NUMBER").not_null(),
            SourceColumn::new("UPDATED_AT", "TIMESTAMP_NTZ"),
        ]
    }

    struct Fixture {
        _dir: TempDir,
        source: Arc<MemoryWarehouse>,
        destination: Arc<SqliteStore>,
        ledger: Arc<SqliteLedger>,
        staging: StagingArea,
        transporter: BatchTransporter,
    }

    fn fixture(chunk_size: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(MemoryWarehouse::new());
        source.create_table(orders(), source_columns());
        let destination = Arc::new(SqliteStore::in_memory().unwrap());
        destination
            .create_table(&orders(), &map_columns(&source_columns()))
            .unwrap();
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let staging = StagingArea::new(dir.path().join("staging"));
        let transporter = BatchTransporter::new(
            source.clone(),
            destination.clone(),
            ledger.clone(),
            staging.clone(),
            chunk_size,
        );
        Fixture {
            _dir: dir,
            source,
            destination,
            ledger,
            staging,
            transporter,
        }
    }

    fn running(ledger: &SqliteLedger, request: &SyncRequest) -> JobId {
        let id = ledger.create(request).unwrap();
        ledger
            .transition(id, JobStatus::Running, TransitionFields::none())
            .unwrap();
        id
    }

    fn plan(strategy: SyncStrategy, last_watermark: Option<Value>) -> TransportPlan {
        TransportPlan {
            table_ref: orders(),
            columns: map_columns(&source_columns()),
            strategy,
            filter: None,
            last_watermark,
        }
    }

    fn seed(source: &MemoryWarehouse, ids: std::ops::Range<u32>) {
        source
            .insert_rows(
                &orders(),
                ids.map(|i| {
                    vec![
                        Value::Number(f64::from(i)),
                        ts(&format!("2024-01-{:02} 00:00:00", i % 28 + 1)),
                    ]
                }),
            )
            .unwrap();
    }

    #[test]
    fn full_pass_replaces_rows_and_walks_every_phase() {
        let f = fixture(7);
        seed(&f.source, 0..25);
        let id = running(&f.ledger, &SyncRequest::full(orders()));

        let outcome = f
            .transporter
            .run(id, 1, &plan(SyncStrategy::Full, None))
            .unwrap();
        assert_eq!(outcome.exported_rows, 25);
        assert_eq!(outcome.loaded_rows, 25);
        assert!(outcome.bytes > 0);
        assert_eq!(
            outcome.phases,
            [
                TransportPhase::Exporting,
                TransportPhase::Staged,
                TransportPhase::Loading,
                TransportPhase::Verified,
                TransportPhase::Cleaned,
            ]
        );

        // A second pass replaces rather than appends.
        f.transporter
            .run(id, 2, &plan(SyncStrategy::Full, None))
            .unwrap();
        assert_eq!(f.destination.row_count(&orders()).unwrap(), 25);

        let job = f.ledger.get(id).unwrap();
        assert_eq!(job.stats.rows_processed, 25);
        assert_eq!(job.stats.total_rows, Some(25));
        assert!(job.heartbeat_at.is_some());

        assert!(!f.staging.job_dir(id).exists());
        assert_eq!(f.source.open_exports(), 0);
    }

    #[test]
    fn incremental_pass_appends_rows_after_watermark() {
        let f = fixture(10);
        seed(&f.source, 0..28);
        let id = running(
            &f.ledger,
            &SyncRequest::incremental(orders(), "updated_at"),
        );

        let strategy = SyncStrategy::incremental("updated_at");
        let outcome = f
            .transporter
            .run(id, 1, &plan(strategy.clone(), Some(ts("2024-01-20 00:00:00"))))
            .unwrap();

        assert_eq!(outcome.exported_rows, 8);
        assert_eq!(outcome.watermark, Some(ts("2024-01-28 00:00:00")));
        assert_eq!(f.destination.row_count(&orders()).unwrap(), 8);

        let outcome = f
            .transporter
            .run(id, 2, &plan(strategy, Some(ts("2024-01-26 00:00:00"))))
            .unwrap();
        assert_eq!(outcome.exported_rows, 2);
        assert_eq!(f.destination.row_count(&orders()).unwrap(), 10);
    }

    #[test]
    fn empty_incremental_pass_has_no_watermark() {
        let f = fixture(10);
        seed(&f.source, 0..5);
        let id = running(&f.ledger, &SyncRequest::incremental(orders(), "UPDATED_AT"));

        let outcome = f
            .transporter
            .run(
                id,
                1,
                &plan(
                    SyncStrategy::incremental("UPDATED_AT"),
                    Some(ts("2030-01-01 00:00:00")),
                ),
            )
            .unwrap();
        assert_eq!(outcome.exported_rows, 0);
        assert_eq!(outcome.watermark, None);
    }

    #[test]
    fn unknown_watermark_column_is_fatal() {
        let f = fixture(10);
        let id = running(&f.ledger, &SyncRequest::incremental(orders(), "nope"));

        let mut phases = Vec::new();
        let err = f
            .transporter
            .run_logged(
                id,
                1,
                &plan(SyncStrategy::incremental("nope"), None),
                &mut phases,
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRequest(_)));
        assert!(!err.is_retryable());
        assert_eq!(phases, [TransportPhase::Exporting, TransportPhase::Failed]);
        assert!(!f.staging.job_dir(id).exists());
    }

    #[test]
    fn staging_failure_releases_export_and_file() {
        let f = fixture(3);
        f.source
            .insert_rows(
                &orders(),
                vec![vec![Value::Text("not a number".into()), Value::Null]],
            )
            .unwrap();
        let id = running(&f.ledger, &SyncRequest::full(orders()));

        let err = f
            .transporter
            .run(id, 1, &plan(SyncStrategy::Full, None))
            .unwrap_err();
        assert!(matches!(err, SyncError::Staging(_)));
        assert_eq!(f.source.open_exports(), 0);
        assert!(!f.staging.job_dir(id).exists());
    }

    #[test]
    fn heartbeat_fails_once_job_is_no_longer_running() {
        let f = fixture(5);
        seed(&f.source, 0..10);
        let id = running(&f.ledger, &SyncRequest::full(orders()));
        f.ledger
            .transition(id, JobStatus::Failed, TransitionFields::failed("reaped"))
            .unwrap();

        let err = f
            .transporter
            .run(id, 1, &plan(SyncStrategy::Full, None))
            .unwrap_err();
        assert!(matches!(err, SyncError::Ledger(_)));
        assert_eq!(f.source.open_exports(), 0);
    }

    #[test]
    fn export_filter_combines_explicit_and_watermark() {
        let mut p = plan(SyncStrategy::incremental("UPDATED_AT"), None);
        assert_eq!(p.export_filter(), None);

        p.filter = Some(Predicate::eq("ID", Value::Number(1.0)));
        assert_eq!(p.export_filter(), p.filter);

        p.last_watermark = Some(ts("2024-01-01 00:00:00"));
        assert_eq!(
            p.export_filter(),
            Some(
                Predicate::eq("ID", Value::Number(1.0))
                    .and(Predicate::gt("UPDATED_AT", ts("2024-01-01 00:00:00")))
            )
        );

        let full = TransportPlan {
            strategy: SyncStrategy::Full,
            filter: None,
            ..p
        };
        assert_eq!(full.export_filter(), None);
    }
}

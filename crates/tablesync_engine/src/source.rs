//! Source warehouse abstraction.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tablesync_types::{Predicate, Row, SourceColumn, SourceTableRef, TableStats, Value};

/// What to export from a source table.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    /// Table to export.
    pub table_ref: SourceTableRef,
    /// Columns to project, in output order.
    pub columns: Vec<String>,
    /// Row filter; `None` exports every row.
    pub filter: Option<Predicate>,
    /// Maximum rows per chunk.
    pub chunk_size: usize,
}

/// A source-side export in progress.
///
/// Holds whatever the source needs for the export (a stage, a result set).
/// [`ExportCursor::release`] frees it and must be called on every path.
pub trait ExportCursor: Send {
    /// Returns the next chunk, or `None` once the export is exhausted.
    fn next_chunk(&mut self) -> SyncResult<Option<Vec<Row>>>;

    /// Releases source-side resources. Calling it twice is a no-op.
    fn release(&mut self) -> SyncResult<()>;
}

/// The remote warehouse rows are read from.
///
/// # Implementors
///
/// - [`MemoryWarehouse`] - in-process tables, for tests and demos
/// - [`crate::SqliteWarehouse`] - tables in a SQLite database file
pub trait SourceWarehouse: Send + Sync {
    /// Returns the table's columns in ordinal order.
    ///
    /// Fails with [`SyncError::TableNotFound`] if the table does not exist.
    fn describe_table(&self, table: &SourceTableRef) -> SyncResult<Vec<SourceColumn>>;

    /// Starts a chunked export.
    fn open_export(&self, request: &ExportRequest) -> SyncResult<Box<dyn ExportCursor>>;

    /// Returns row count and storage size of a table.
    fn table_stats(&self, table: &SourceTableRef) -> SyncResult<TableStats>;
}

impl<S: SourceWarehouse + ?Sized> SourceWarehouse for Arc<S> {
    fn describe_table(&self, table: &SourceTableRef) -> SyncResult<Vec<SourceColumn>> {
        (**self).describe_table(table)
    }

    fn open_export(&self, request: &ExportRequest) -> SyncResult<Box<dyn ExportCursor>> {
        (**self).open_export(request)
    }

    fn table_stats(&self, table: &SourceTableRef) -> SyncResult<TableStats> {
        (**self).table_stats(table)
    }
}

/// Approximate storage size of a value.
pub(crate) fn value_size(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        Value::Boolean(_) => 1,
        Value::Date(_) => 4,
        Value::Number(_) | Value::Timestamp(_) | Value::TimestampTz(_) => 8,
        Value::Text(s) => s.len() as u64,
    }
}

/// Index of `name` among `columns`, ignoring ASCII case.
pub(crate) fn column_index(columns: &[String], name: &str) -> Option<usize> {
    columns.iter().position(|c| c.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<SourceColumn>,
    rows: Vec<Row>,
}

impl MemoryTable {
    fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// An in-memory source warehouse.
///
/// Exports snapshot the matching rows when opened, so writes made during an
/// export are not observed by it.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: RwLock<BTreeMap<SourceTableRef, MemoryTable>>,
    open_exports: Arc<AtomicUsize>,
}

impl MemoryWarehouse {
    /// Creates an empty warehouse.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or replaces) a table with the given columns and no rows.
    pub fn create_table(&self, table: SourceTableRef, columns: Vec<SourceColumn>) {
        self.tables.write().insert(
            table,
            MemoryTable {
                columns,
                rows: Vec::new(),
            },
        );
    }

    /// Appends rows to a table.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TableNotFound`] for an unknown table and
    /// [`SyncError::InvalidRequest`] if a row's width doesn't match the table.
    pub fn insert_rows(
        &self,
        table: &SourceTableRef,
        rows: impl IntoIterator<Item = Row>,
    ) -> SyncResult<()> {
        let mut tables = self.tables.write();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| SyncError::TableNotFound(table.clone()))?;
        let width = entry.columns.len();
        for row in rows {
            if row.len() != width {
                return Err(SyncError::InvalidRequest(format!(
                    "row has {} values, {table} has {width} columns",
                    row.len()
                )));
            }
            entry.rows.push(row);
        }
        Ok(())
    }

    /// Appends a column; existing rows get NULL.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TableNotFound`] for an unknown table.
    pub fn add_column(&self, table: &SourceTableRef, column: SourceColumn) -> SyncResult<()> {
        let mut tables = self.tables.write();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| SyncError::TableNotFound(table.clone()))?;
        entry.columns.push(column);
        for row in &mut entry.rows {
            row.push(Value::Null);
        }
        Ok(())
    }

    /// Changes the reported type of a column. Stored values are left as they are.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TableNotFound`] for an unknown table and
    /// [`SyncError::InvalidRequest`] for an unknown column.
    pub fn alter_column_type(
        &self,
        table: &SourceTableRef,
        column: &str,
        data_type: &str,
    ) -> SyncResult<()> {
        let mut tables = self.tables.write();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| SyncError::TableNotFound(table.clone()))?;
        let target = entry
            .columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(column))
            .ok_or_else(|| SyncError::InvalidRequest(format!("unknown column {column}")))?;
        target.data_type = data_type.to_string();
        Ok(())
    }

    /// Removes a table. Returns false if it didn't exist.
    pub fn drop_table(&self, table: &SourceTableRef) -> bool {
        self.tables.write().remove(table).is_some()
    }

    /// Number of rows in a table, if it exists.
    pub fn row_count(&self, table: &SourceTableRef) -> Option<usize> {
        self.tables.read().get(table).map(|t| t.rows.len())
    }

    /// Number of exports opened and not yet released.
    pub fn open_exports(&self) -> usize {
        self.open_exports.load(Ordering::SeqCst)
    }
}

impl SourceWarehouse for MemoryWarehouse {
    fn describe_table(&self, table: &SourceTableRef) -> SyncResult<Vec<SourceColumn>> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| SyncError::TableNotFound(table.clone()))
    }

    fn open_export(&self, request: &ExportRequest) -> SyncResult<Box<dyn ExportCursor>> {
        let tables = self.tables.read();
        let table = tables
            .get(&request.table_ref)
            .ok_or_else(|| SyncError::TableNotFound(request.table_ref.clone()))?;

        let names = table.column_names();
        let projection = request
            .columns
            .iter()
            .map(|name| {
                column_index(&names, name).ok_or_else(|| {
                    SyncError::InvalidRequest(format!(
                        "unknown column {name} in {}",
                        request.table_ref
                    ))
                })
            })
            .collect::<SyncResult<Vec<_>>>()?;

        let rows: Vec<Row> = table
            .rows
            .iter()
            .filter(|row| {
                request
                    .filter
                    .as_ref()
                    .map_or(true, |filter| filter.matches(&names, row))
            })
            .map(|row| projection.iter().map(|&idx| row[idx].clone()).collect())
            .collect();

        self.open_exports.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryCursor {
            rows: rows.into_iter(),
            chunk_size: request.chunk_size.max(1),
            open: Some(Arc::clone(&self.open_exports)),
        }))
    }

    fn table_stats(&self, table: &SourceTableRef) -> SyncResult<TableStats> {
        let tables = self.tables.read();
        let entry = tables
            .get(table)
            .ok_or_else(|| SyncError::TableNotFound(table.clone()))?;
        let size_bytes = entry
            .rows
            .iter()
            .flat_map(|row| row.iter())
            .map(value_size)
            .sum();
        Ok(TableStats {
            row_count: entry.rows.len() as u64,
            size_bytes,
        })
    }
}

struct MemoryCursor {
    rows: std::vec::IntoIter<Row>,
    chunk_size: usize,
    open: Option<Arc<AtomicUsize>>,
}

impl ExportCursor for MemoryCursor {
    fn next_chunk(&mut self) -> SyncResult<Option<Vec<Row>>> {
        let chunk: Vec<Row> = self.rows.by_ref().take(self.chunk_size).collect();
        Ok(if chunk.is_empty() { None } else { Some(chunk) })
    }

    fn release(&mut self) -> SyncResult<()> {
        if let Some(counter) = self.open.take() {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> SourceTableRef {
        SourceTableRef::new("sales", "orders")
    }

    fn warehouse_with_rows(n: usize) -> MemoryWarehouse {
        let warehouse = MemoryWarehouse::new();
        warehouse.create_table(
            orders(),
            vec![
                SourceColumn::new("ID", "NUMBER").not_null(),
                SourceColumn::new("REGION", "VARCHAR"),
            ],
        );
        warehouse
            .insert_rows(
                &orders(),
                (0..n).map(|i| {
                    vec![
                        Value::Number(i as f64),
                        Value::Text(if i % 2 == 0 { "eu" } else { "us" }.into()),
                    ]
                }),
            )
            .unwrap();
        warehouse
    }

    fn request(chunk_size: usize) -> ExportRequest {
        ExportRequest {
            table_ref: orders(),
            columns: vec!["id".into(), "region".into()],
            filter: None,
            chunk_size,
        }
    }

    fn drain(cursor: &mut dyn ExportCursor) -> Vec<Vec<Row>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = cursor.next_chunk().unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn unknown_table() {
        let warehouse = MemoryWarehouse::new();
        assert!(matches!(
            warehouse.describe_table(&orders()),
            Err(SyncError::TableNotFound(_))
        ));
        assert!(matches!(
            warehouse.open_export(&request(10)),
            Err(SyncError::TableNotFound(_))
        ));
    }

    #[test]
    fn export_is_chunked() {
        let warehouse = warehouse_with_rows(25);
        let mut cursor = warehouse.open_export(&request(10)).unwrap();
        let sizes: Vec<usize> = drain(cursor.as_mut()).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn export_applies_filter_and_projection() {
        let warehouse = warehouse_with_rows(10);
        let mut req = request(100);
        req.columns = vec!["REGION".into()];
        req.filter = Some(Predicate::eq("region", Value::Text("eu".into())));

        let mut cursor = warehouse.open_export(&req).unwrap();
        let rows: Vec<Row> = drain(cursor.as_mut()).into_iter().flatten().collect();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r == &vec![Value::Text("eu".into())]));
    }

    #[test]
    fn unknown_projection_column_is_rejected() {
        let warehouse = warehouse_with_rows(1);
        let mut req = request(10);
        req.columns.push("missing".into());
        assert!(matches!(
            warehouse.open_export(&req),
            Err(SyncError::InvalidRequest(_))
        ));
        assert_eq!(warehouse.open_exports(), 0);
    }

    #[test]
    fn release_is_tracked() {
        let warehouse = warehouse_with_rows(3);
        let mut cursor = warehouse.open_export(&request(10)).unwrap();
        assert_eq!(warehouse.open_exports(), 1);
        cursor.release().unwrap();
        cursor.release().unwrap();
        assert_eq!(warehouse.open_exports(), 0);

        let cursor = warehouse.open_export(&request(10)).unwrap();
        assert_eq!(warehouse.open_exports(), 1);
        drop(cursor);
        assert_eq!(warehouse.open_exports(), 0);
    }

    #[test]
    fn added_columns_backfill_null() {
        let warehouse = warehouse_with_rows(2);
        warehouse
            .add_column(&orders(), SourceColumn::new("NOTE", "TEXT"))
            .unwrap();
        let mut req = request(10);
        req.columns.push("note".into());
        let mut cursor = warehouse.open_export(&req).unwrap();
        let rows: Vec<Row> = drain(cursor.as_mut()).into_iter().flatten().collect();
        assert!(rows.iter().all(|r| r[2] == Value::Null));
    }

    #[test]
    fn insert_rejects_wrong_width() {
        let warehouse = warehouse_with_rows(0);
        let err = warehouse
            .insert_rows(&orders(), vec![vec![Value::Number(1.0)]])
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRequest(_)));
    }

    #[test]
    fn stats_count_rows_and_bytes() {
        let warehouse = warehouse_with_rows(4);
        let stats = warehouse.table_stats(&orders()).unwrap();
        assert_eq!(stats.row_count, 4);
        assert_eq!(stats.size_bytes, 4 * (8 + 2));
    }
}

//! Schema reconciliation between source and destination.
//!
//! Reconciliation is additive only: columns are created or appended, never
//! dropped, reordered or retyped. An existing column whose declared type
//! falls in a different family than the newly mapped type is a conflict.

use crate::destination::{DestinationStore, ExistingColumn};
use crate::error::{SyncError, SyncResult};
use crate::source::SourceWarehouse;
use crate::type_map::map_columns;
use std::sync::Arc;
use tablesync_types::{ColumnDescriptor, SourceTableRef, TypeFamily};
use tracing::{debug, info};

/// What [`SchemaReconciler::ensure_destination_schema`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// The destination table did not exist and was created.
    Created,
    /// Every source column was already present and compatible.
    Unchanged,
    /// New source columns were appended.
    Evolved {
        /// Names of the appended columns.
        added: Vec<String>,
    },
}

/// Differences between mapped source columns and an existing destination table.
#[derive(Debug, Default)]
struct SchemaDrift {
    new_columns: Vec<ColumnDescriptor>,
    removed_columns: Vec<String>,
    /// (name, existing declared type, incoming type)
    type_changes: Vec<(String, String, String)>,
}

fn detect_drift(existing: &[ExistingColumn], columns: &[ColumnDescriptor]) -> SchemaDrift {
    let find = |name: &str| existing.iter().find(|e| e.name.eq_ignore_ascii_case(name));

    let mut drift = SchemaDrift::default();
    for column in columns {
        match find(&column.name) {
            Some(current) => {
                let incoming = column.destination_type.family();
                if TypeFamily::of_declared(&current.declared_type) != incoming {
                    drift.type_changes.push((
                        column.name.clone(),
                        current.declared_type.clone(),
                        column.destination_type.sql_name(),
                    ));
                }
            }
            None => drift.new_columns.push(column.clone()),
        }
    }
    drift.removed_columns = existing
        .iter()
        .filter(|e| !columns.iter().any(|c| c.name.eq_ignore_ascii_case(&e.name)))
        .map(|e| e.name.clone())
        .collect();
    drift
}

/// Fetches source schemas and keeps destination tables in line with them.
pub struct SchemaReconciler {
    source: Arc<dyn SourceWarehouse>,
    destination: Arc<dyn DestinationStore>,
}

impl SchemaReconciler {
    /// Creates a reconciler over the two data systems.
    pub fn new(source: Arc<dyn SourceWarehouse>, destination: Arc<dyn DestinationStore>) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Fetches and maps the source table's columns, in ordinal order.
    pub fn fetch_source_schema(&self, table: &SourceTableRef) -> SyncResult<Vec<ColumnDescriptor>> {
        let columns = self.source.describe_table(table)?;
        if columns.is_empty() {
            return Err(SyncError::TableNotFound(table.clone()));
        }
        Ok(map_columns(&columns))
    }

    /// Creates the destination table, or validates and extends it.
    ///
    /// On conflict nothing is changed.
    pub fn ensure_destination_schema(
        &self,
        table: &SourceTableRef,
        columns: &[ColumnDescriptor],
    ) -> SyncResult<SchemaChange> {
        let Some(existing) = self.destination.existing_columns(table)? else {
            self.destination.create_table(table, columns)?;
            info!(table = %table, columns = columns.len(), "destination table created");
            return Ok(SchemaChange::Created);
        };

        let drift = detect_drift(&existing, columns);
        if let Some((column, existing, incoming)) = drift.type_changes.into_iter().next() {
            return Err(SyncError::SchemaConflict {
                table: table.clone(),
                column,
                existing,
                incoming,
            });
        }
        if !drift.removed_columns.is_empty() {
            debug!(
                table = %table,
                columns = ?drift.removed_columns,
                "destination columns no longer in source; keeping them"
            );
        }
        if drift.new_columns.is_empty() {
            return Ok(SchemaChange::Unchanged);
        }

        let mut added = Vec::with_capacity(drift.new_columns.len());
        for column in &drift.new_columns {
            self.destination.add_column(table, column)?;
            added.push(column.name.clone());
        }
        info!(table = %table, added = ?added, "destination schema evolved");
        Ok(SchemaChange::Evolved { added })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::SqliteStore;
    use crate::source::MemoryWarehouse;
    use tablesync_types::SourceColumn;

    fn orders() -> SourceTableRef {
        SourceTableRef::new("sales", "orders")
    }

    fn setup() -> (Arc<MemoryWarehouse>, Arc<SqliteStore>, SchemaReconciler) {
        let source = Arc::new(MemoryWarehouse::new());
        source.create_table(
            orders(),
            vec![
                SourceColumn::new("ID", "NUMBER").not_null(),
                SourceColumn::new("AMOUNT", "NUMBER(12,2)"),
            ],
        );
        let destination = Arc::new(SqliteStore::in_memory().unwrap());
        let reconciler = SchemaReconciler::new(source.clone(), destination.clone());
        (source, destination, reconciler)
    }

    #[test]
    fn missing_source_table_is_not_found() {
        let (_, _, reconciler) = setup();
        let err = reconciler
            .fetch_source_schema(&SourceTableRef::new("sales", "nope"))
            .unwrap_err();
        assert!(matches!(err, SyncError::TableNotFound(_)));
    }

    #[test]
    fn creates_then_is_idempotent() {
        let (_, destination, reconciler) = setup();
        let columns = reconciler.fetch_source_schema(&orders()).unwrap();

        assert_eq!(
            reconciler
                .ensure_destination_schema(&orders(), &columns)
                .unwrap(),
            SchemaChange::Created
        );
        assert_eq!(
            reconciler
                .ensure_destination_schema(&orders(), &columns)
                .unwrap(),
            SchemaChange::Unchanged
        );
        assert_eq!(
            destination.existing_columns(&orders()).unwrap().unwrap().len(),
            2
        );
    }

    #[test]
    fn new_source_columns_are_appended() {
        let (source, destination, reconciler) = setup();
        let columns = reconciler.fetch_source_schema(&orders()).unwrap();
        reconciler
            .ensure_destination_schema(&orders(), &columns)
            .unwrap();

        source
            .add_column(&orders(), SourceColumn::new("NOTE", "VARCHAR"))
            .unwrap();
        let columns = reconciler.fetch_source_schema(&orders()).unwrap();
        assert_eq!(
            reconciler
                .ensure_destination_schema(&orders(), &columns)
                .unwrap(),
            SchemaChange::Evolved {
                added: vec!["NOTE".into()]
            }
        );

        let names: Vec<String> = destination
            .existing_columns(&orders())
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["ID", "AMOUNT", "NOTE"]);
    }

    #[test]
    fn removed_source_columns_are_kept() {
        let (source, destination, reconciler) = setup();
        let columns = reconciler.fetch_source_schema(&orders()).unwrap();
        reconciler
            .ensure_destination_schema(&orders(), &columns)
            .unwrap();

        source.create_table(orders(), vec![SourceColumn::new("ID", "NUMBER")]);
        let columns = reconciler.fetch_source_schema(&orders()).unwrap();
        assert_eq!(
            reconciler
                .ensure_destination_schema(&orders(), &columns)
                .unwrap(),
            SchemaChange::Unchanged
        );
        assert_eq!(
            destination.existing_columns(&orders()).unwrap().unwrap().len(),
            2
        );
    }

    #[test]
    fn incompatible_type_is_a_conflict() {
        let (source, destination, reconciler) = setup();
        let columns = reconciler.fetch_source_schema(&orders()).unwrap();
        reconciler
            .ensure_destination_schema(&orders(), &columns)
            .unwrap();

        source
            .alter_column_type(&orders(), "AMOUNT", "VARCHAR")
            .unwrap();
        source
            .add_column(&orders(), SourceColumn::new("NOTE", "TEXT"))
            .unwrap();
        let columns = reconciler.fetch_source_schema(&orders()).unwrap();
        let err = reconciler
            .ensure_destination_schema(&orders(), &columns)
            .unwrap_err();

        match &err {
            SyncError::SchemaConflict {
                column, existing, ..
            } => {
                assert_eq!(column, "AMOUNT");
                assert_eq!(existing, "DOUBLE");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.is_retryable());
        // Nothing was added.
        assert_eq!(
            destination.existing_columns(&orders()).unwrap().unwrap().len(),
            2
        );
    }

    #[test]
    fn same_family_types_are_compatible() {
        let existing = vec![ExistingColumn {
            name: "name".into(),
            declared_type: "TEXT".into(),
            nullable: true,
        }];
        let columns = map_columns(&[SourceColumn::new("NAME", "VARCHAR").with_max_length(10)]);
        let drift = detect_drift(&existing, &columns);
        assert!(drift.type_changes.is_empty());
        assert!(drift.new_columns.is_empty());
    }
}

//! Table references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a table in the source warehouse.
///
/// Immutable once a job references it. The same reference names the
/// destination table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceTableRef {
    /// Schema the table lives in.
    pub schema_name: String,
    /// Table name.
    pub table_name: String,
}

impl SourceTableRef {
    /// Creates a new table reference.
    pub fn new(schema_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
        }
    }

    /// Returns `schema.table`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }
}

impl fmt::Display for SourceTableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema_name, self.table_name)
    }
}

/// A table on the sync allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredTable {
    /// The registered table.
    pub table_ref: SourceTableRef,
    /// Whether syncs may currently be submitted for it.
    pub active: bool,
    /// When the table was first registered.
    pub registered_at: DateTime<Utc>,
}

/// Size statistics the source reports for a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    /// Number of rows.
    pub row_count: u64,
    /// Storage size in bytes.
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_and_display_agree() {
        let table = SourceTableRef::new("sales", "orders");
        assert_eq!(table.qualified_name(), "sales.orders");
        assert_eq!(table.to_string(), "sales.orders");
    }
}

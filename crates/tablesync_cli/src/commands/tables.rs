//! Allow-list commands.

use super::{build_service, emit, open_ledger, table_ref, CommandResult, DataArgs, Format};
use std::path::Path;
use tablesync_ledger::JobLedger;
use tablesync_types::RegisteredTable;

/// Registers a table after checking the source has it.
pub fn add(
    ledger: &Path,
    data: &DataArgs,
    schema: &str,
    table: &str,
    format: Format,
) -> CommandResult {
    let service = build_service(ledger, data, data.config())?;
    let registered = service.register_table(&table_ref(schema, table))?;
    emit(format, &registered, |t| println!("Registered {}", t.table_ref))
}

/// Deactivates a table.
pub fn remove(ledger: &Path, schema: &str, table: &str) -> CommandResult {
    let table = table_ref(schema, table);
    if open_ledger(ledger)?.deactivate_table(&table)? {
        println!("Deactivated {table}");
    } else {
        println!("{table} is not registered");
    }
    Ok(())
}

/// Lists registered tables.
pub fn list(ledger: &Path, format: Format) -> CommandResult {
    let tables = open_ledger(ledger)?.list_tables()?;
    emit(format, &tables, |tables| {
        if tables.is_empty() {
            println!("No registered tables");
        }
        for table in tables {
            println!("{}", table_line(table));
        }
    })
}

fn table_line(table: &RegisteredTable) -> String {
    format!(
        "{:<40}  {:<8}  registered {}",
        table.table_ref.to_string(),
        if table.active { "active" } else { "inactive" },
        table.registered_at.to_rfc3339()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_ledger::SqliteLedger;
    use tablesync_types::SourceTableRef;
    use tempfile::TempDir;

    #[test]
    fn table_line_marks_inactive() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let orders = SourceTableRef::new("main", "orders");
        ledger.register_table(&orders).unwrap();
        ledger.deactivate_table(&orders).unwrap();

        let tables = ledger.list_tables().unwrap();
        let line = table_line(&tables[0]);
        assert!(line.starts_with("main.orders"));
        assert!(line.contains("inactive"));
    }

    #[test]
    fn add_checks_the_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.db");
        rusqlite::Connection::open(&source)
            .unwrap()
            .execute_batch("CREATE TABLE orders (id INTEGER NOT NULL, amount REAL);")
            .unwrap();

        let data = DataArgs {
            source,
            destination: dir.path().join("destination.db"),
            staging: dir.path().join("staging"),
            chunk_size: 100,
        };
        let ledger = dir.path().join("ledger.db");

        add(&ledger, &data, "main", "orders", Format::Json).unwrap();
        assert!(add(&ledger, &data, "main", "missing", Format::Json).is_err());

        let tables = open_ledger(&ledger).unwrap().list_tables().unwrap();
        assert_eq!(tables.len(), 1);
        assert!(tables[0].active);
    }
}

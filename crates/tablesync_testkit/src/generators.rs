//! Property-based test generators using proptest.

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use proptest::prelude::*;
use tablesync_types::{SourceColumn, SourceTableRef, Value};

/// Strategy for warehouse-style identifiers.
pub fn identifier_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z][A-Za-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for table references.
pub fn table_ref_strategy() -> impl Strategy<Value = SourceTableRef> {
    (identifier_strategy(), identifier_strategy())
        .prop_map(|(schema, table)| SourceTableRef::new(schema, table))
}

/// Strategy for raw source type names, known and unknown, with optional parameters.
pub fn source_type_name_strategy() -> impl Strategy<Value = String> {
    let known = prop::sample::select(vec![
        "NUMBER",
        "DECIMAL",
        "INTEGER",
        "FLOAT",
        "DOUBLE",
        "VARCHAR",
        "CHAR",
        "TEXT",
        "STRING",
        "BOOLEAN",
        "DATE",
        "TIMESTAMP_NTZ",
        "TIMESTAMP_TZ",
        "TIMESTAMP_LTZ",
        "VARIANT",
        "GEOGRAPHY",
    ]);
    let params = prop::option::of((1u32..100, prop::option::of(0u32..10)));
    (known, params).prop_map(|(base, params)| match params {
        Some((p, Some(s))) => format!("{base}({p},{s})"),
        Some((p, None)) => format!("{base}({p})"),
        None => base.to_string(),
    })
}

/// Strategy for source columns with arbitrary type names.
pub fn source_column_strategy() -> impl Strategy<Value = SourceColumn> {
    (
        identifier_strategy(),
        source_type_name_strategy(),
        any::<bool>(),
        prop::option::of(1u32..10_000),
    )
        .prop_map(|(name, data_type, nullable, max_length)| {
            let mut column = SourceColumn::new(name, data_type);
            column.nullable = nullable;
            column.max_length = max_length;
            column
        })
}

/// Strategy for naive timestamps within a few years of 2024.
pub fn timestamp_strategy() -> impl Strategy<Value = NaiveDateTime> {
    (0i64..100_000_000).prop_map(|secs| {
        NaiveDate::from_ymd_opt(2022, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid epoch")
            + TimeDelta::seconds(secs)
    })
}

/// Strategy for watermark values, including NULL.
pub fn watermark_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        1 => Just(Value::Null),
        8 => timestamp_strategy().prop_map(Value::Timestamp),
    ]
}

/// Strategy for a sequence of incremental sync steps. Each step appends a
/// batch of order IDs to the source; the flag says whether its sync succeeds.
pub fn sync_steps_strategy() -> impl Strategy<Value = Vec<(Vec<u32>, bool)>> {
    prop::collection::vec(
        (
            prop::collection::vec(0u32..10_000, 0..20),
            prop::bool::weighted(0.7),
        ),
        1..8,
    )
}

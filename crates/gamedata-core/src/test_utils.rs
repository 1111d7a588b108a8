//! Shared test helpers for unit tests, integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available outside this crate via the `test-utils` feature.

use crate::guard::Clock;
use crate::provider::{MemoryProvider, MemoryTable};
use crate::schema::{ColumnDef, Schema};
use crate::table::{IdMapping, Record, SourceLayer, TableInstance};
use crate::value::{ColumnType, FieldValue, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ===========================================================================
// Clock
// ===========================================================================

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

// ===========================================================================
// Table instances
// ===========================================================================

fn build(name: &str, columns: Vec<ColumnDef>, rows: Vec<Vec<FieldValue>>) -> TableInstance {
    let schema = Arc::new(Schema::new(name, columns));
    let records = rows
        .into_iter()
        .enumerate()
        .map(|(row, fields)| Record::new(row, fields, Arc::clone(&schema)))
        .collect();
    TableInstance::new(
        name,
        SourceLayer::Base,
        schema,
        records,
        IdMapping::RowIndex,
        false,
    )
}

/// A table of text columns with `rows` rows. Cells read `<column>_<row>`.
pub fn instance(name: &str, columns: &[&str], rows: usize) -> TableInstance {
    let defs = columns
        .iter()
        .map(|c| ColumnDef::new(c, ColumnType::Text))
        .collect();
    let data = (0..rows)
        .map(|row| {
            columns
                .iter()
                .map(|c| FieldValue::Text(format!("{c}_{row}")))
                .collect()
        })
        .collect();
    build(name, defs, data)
}

/// A single integer column table, one row per value.
pub fn int_instance(name: &str, column: &str, values: &[i64]) -> TableInstance {
    build(
        name,
        vec![ColumnDef::new(column, ColumnType::Int)],
        values.iter().map(|v| vec![FieldValue::Int(*v)]).collect(),
    )
}

/// A single text column table, one row per value. `****` becomes null.
pub fn text_instance(name: &str, column: &str, values: &[&str]) -> TableInstance {
    build(
        name,
        vec![ColumnDef::new(column, ColumnType::Text)],
        values
            .iter()
            .map(|v| {
                let field = ColumnType::Text
                    .coerce(&Value::from(*v))
                    .unwrap_or(FieldValue::Null);
                vec![field]
            })
            .collect(),
    )
}

// ===========================================================================
// Providers
// ===========================================================================

/// A memory table with a `Label` text column and a `Name` string reference
/// column. Row `i` references string id `first_string + (i % distinct)`.
pub fn labelled_table(name: &str, rows: usize, first_string: u32, distinct: u32) -> MemoryTable {
    let mut table = MemoryTable::new(name, &["Label", "Name"]);
    for row in 0..rows {
        let id = first_string + (row as u32 % distinct.max(1));
        table = table.with_row(vec![
            Value::from(format!("{name}_{row}")),
            Value::Int(i64::from(id)),
        ]);
    }
    table
}

/// A small base-content provider: `classes`, `racialtypes`, `feat` and a
/// `racialsubtypes` table referencing the first two, with resolvable strings.
pub fn base_provider() -> MemoryProvider {
    let mut provider = MemoryProvider::new()
        .with_base(labelled_table("classes", 4, 100, 4))
        .with_base(labelled_table("racialtypes", 3, 200, 3))
        .with_base(labelled_table("feat", 6, 300, 6))
        .with_base(
            MemoryTable::new("racialsubtypes", &["Label", "Name", "ClassID", "RacialTypeID"])
                .with_row(vec![
                    Value::from("drow"),
                    Value::Int(400),
                    Value::Int(0),
                    Value::Int(1),
                ])
                .with_row(vec![
                    Value::from("duergar"),
                    Value::Int(401),
                    Value::Int(3),
                    Value::Int(2),
                ]),
        );
    for id in (100..104).chain(200..203).chain(300..306).chain(400..402) {
        provider.insert_string(id, &format!("string {id}"));
    }
    provider
}

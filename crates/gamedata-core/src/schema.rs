//! Record schemas and the batch constructor that turns raw rows into records.
//!
//! A table's [`RecordType`] is either [`RecordType::Known`], backed by a
//! precompiled [`StaticRecordType`] for well-known base tables, or
//! [`RecordType::Dynamic`], backed by a schema inferred for custom content.
//! Both construct rows the same way; they differ in provenance.

use crate::table::{Record, RowError};
use crate::value::{ColumnType, FieldValue, RawRow, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolved string table entries: string id -> text.
pub type StringCache = HashMap<u32, String>;

/// Why a schema could not be generated for a table.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SynthesisError {
    #[error("table '{table}' has no columns")]
    NoColumns { table: String },

    #[error("table '{table}' has duplicate column '{column}'")]
    DuplicateColumn { table: String, column: String },

    #[error("failed to render schema source for '{table}': {detail}")]
    Render { table: String, detail: String },

    #[error("generated schema source for '{table}' is invalid: {detail}")]
    InvalidSource { table: String, detail: String },
}

// ===========================================================================
// Schema
// ===========================================================================

/// One column of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

impl ColumnDef {
    pub fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SchemaRepr {
    table: String,
    columns: Vec<ColumnDef>,
}

/// Ordered `(name, type)` pairs for one table plus a name index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SchemaRepr", into = "SchemaRepr")]
pub struct Schema {
    table: String,
    columns: Vec<ColumnDef>,
    index: HashMap<String, usize>,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.columns == other.columns
    }
}

impl From<SchemaRepr> for Schema {
    fn from(repr: SchemaRepr) -> Self {
        Schema::new(&repr.table, repr.columns)
    }
}

impl From<Schema> for SchemaRepr {
    fn from(schema: Schema) -> Self {
        SchemaRepr {
            table: schema.table,
            columns: schema.columns,
        }
    }
}

impl Schema {
    pub fn new(table: &str, columns: Vec<ColumnDef>) -> Self {
        let mut index = HashMap::with_capacity(columns.len());
        for (pos, col) in columns.iter().enumerate() {
            index.entry(col.name.to_ascii_lowercase()).or_insert(pos);
        }
        Self {
            table: table.to_string(),
            columns,
            index,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Position of a column (case-insensitive).
    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(&column.to_ascii_lowercase()).copied()
    }

    pub fn column_type(&self, column: &str) -> Option<ColumnType> {
        self.position(column).map(|pos| self.columns[pos].ty)
    }

    /// Build one record from a raw row. String references are filled from
    /// `strings` when present there.
    pub fn construct_row(
        self: &Arc<Self>,
        row: usize,
        raw: &RawRow,
        strings: &StringCache,
    ) -> Result<Record, RowError> {
        let mut fields = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            let value = lookup(raw, &col.name).ok_or_else(|| RowError::MissingColumn {
                row,
                column: col.name.clone(),
            })?;
            let field = col.ty.coerce(value).ok_or_else(|| RowError::TypeMismatch {
                row,
                column: col.name.clone(),
                expected: col.ty,
                found: describe(value),
            })?;
            let field = match field {
                FieldValue::StrRef { id, .. } => FieldValue::StrRef {
                    id,
                    text: strings.get(&id).cloned(),
                },
                other => other,
            };
            fields.push(field);
        }
        Ok(Record::new(row, fields, Arc::clone(self)))
    }
}

fn lookup<'a>(raw: &'a RawRow, column: &str) -> Option<&'a Value> {
    raw.get(column).or_else(|| {
        raw.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(column))
            .map(|(_, v)| v)
    })
}

fn describe(value: &Value) -> String {
    match value.to_text() {
        Some(text) => format!("{} '{}'", value.kind(), text),
        None => value.kind().to_string(),
    }
}

// ===========================================================================
// Static (precompiled) schemas
// ===========================================================================

/// A column of a precompiled schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticColumn {
    pub name: &'static str,
    pub ty: ColumnType,
}

/// A precompiled schema for a well-known base table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticRecordType {
    pub table: &'static str,
    pub columns: &'static [StaticColumn],
}

impl StaticRecordType {
    pub fn to_schema(&self) -> Schema {
        Schema::new(
            self.table,
            self.columns
                .iter()
                .map(|c| ColumnDef::new(c.name, c.ty))
                .collect(),
        )
    }
}

// ===========================================================================
// Record types
// ===========================================================================

/// Record type for a table with a precompiled schema.
#[derive(Debug, Clone)]
pub struct KnownRecordType {
    def: &'static StaticRecordType,
    schema: Arc<Schema>,
}

impl KnownRecordType {
    pub fn new(def: &'static StaticRecordType) -> Self {
        Self {
            def,
            schema: Arc::new(def.to_schema()),
        }
    }

    pub fn definition(&self) -> &'static StaticRecordType {
        self.def
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }
}

/// Record type for a table whose schema was generated at load time.
#[derive(Debug, Clone)]
pub struct GenericRecordType {
    schema: Arc<Schema>,
}

impl GenericRecordType {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema: Arc::new(schema),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }
}

/// Per-table schema plus batch constructor.
#[derive(Debug, Clone)]
pub enum RecordType {
    Known(KnownRecordType),
    Dynamic(GenericRecordType),
}

/// Result of constructing a batch of rows.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub records: Vec<Record>,
    pub rejected: Vec<RowError>,
}

impl BatchOutcome {
    /// Every row was rejected (and there was at least one row).
    pub fn is_total_failure(&self) -> bool {
        self.records.is_empty() && !self.rejected.is_empty()
    }
}

impl RecordType {
    pub fn schema(&self) -> &Arc<Schema> {
        match self {
            RecordType::Known(k) => &k.schema,
            RecordType::Dynamic(g) => &g.schema,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, RecordType::Known(_))
    }

    /// Construct all rows in one call. Rejected rows are collected, not fatal.
    pub fn construct_batch(&self, rows: &[(usize, RawRow)], strings: &StringCache) -> BatchOutcome {
        let schema = self.schema();

        #[cfg(feature = "parallel")]
        let results: Vec<Result<Record, RowError>> = {
            use rayon::prelude::*;
            rows.par_iter()
                .map(|(idx, raw)| schema.construct_row(*idx, raw, strings))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let results: Vec<Result<Record, RowError>> = rows
            .iter()
            .map(|(idx, raw)| schema.construct_row(*idx, raw, strings))
            .collect();

        let mut outcome = BatchOutcome {
            records: Vec::with_capacity(results.len()),
            rejected: Vec::new(),
        };
        for result in results {
            match result {
                Ok(record) => outcome.records.push(record),
                Err(e) => outcome.rejected.push(e),
            }
        }
        outcome
    }
}

//! Table-level types: descriptors produced by discovery, the raw source
//! contract, published table instances and the store that holds them.

use crate::schema::Schema;
use crate::value::{ColumnType, FieldValue, RawRow};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// ===========================================================================
// Errors
// ===========================================================================

/// Why a single row could not be extracted or constructed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RowError {
    #[error("row {row} out of range (table has {count} rows)")]
    OutOfRange { row: usize, count: usize },

    #[error("row {row}: malformed source data: {detail}")]
    Malformed { row: usize, detail: String },

    #[error("row {row}: column '{column}' missing from source")]
    MissingColumn { row: usize, column: String },

    #[error("row {row}: column '{column}' expected {expected}, found {found}")]
    TypeMismatch {
        row: usize,
        column: String,
        expected: ColumnType,
        found: String,
    },
}

// ===========================================================================
// Discovery
// ===========================================================================

/// Which content layer a table was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceLayer {
    /// Shipped with the base product.
    Base,
    /// Added or replaced by a content pack.
    Override,
}

/// A candidate table found during discovery. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: String,
    pub layer: SourceLayer,
    pub row_count: usize,
}

/// Normalized lookup key for a table name.
pub fn table_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

// ===========================================================================
// Raw sources
// ===========================================================================

/// Raw rows of one table after override layering, as exposed by a provider.
pub trait TableSource: Send + Sync {
    fn name(&self) -> &str;

    /// The layer that won for this table.
    fn layer(&self) -> SourceLayer;

    /// Column names in source order.
    fn columns(&self) -> &[String];

    fn row_count(&self) -> usize;

    /// Extract one row. A malformed row is reported, not fatal.
    fn row(&self, index: usize) -> Result<RawRow, RowError>;
}

// ===========================================================================
// Id mapping
// ===========================================================================

/// How a table's declared ids map to its rows. Configured per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdMapping {
    /// The id is the source row index.
    #[default]
    RowIndex,
    /// The id is the source row index plus a fixed offset.
    Offset(i64),
    /// The id is the integer value of the named column.
    Column(String),
}

// ===========================================================================
// Records and instances
// ===========================================================================

/// One constructed row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    row: usize,
    fields: Vec<FieldValue>,
    schema: Arc<Schema>,
}

impl Record {
    pub(crate) fn new(row: usize, fields: Vec<FieldValue>, schema: Arc<Schema>) -> Self {
        Self {
            row,
            fields,
            schema,
        }
    }

    /// Index of the source row this record was built from.
    pub fn row(&self) -> usize {
        self.row
    }

    /// Field value by column name (case-insensitive).
    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.schema
            .position(column)
            .and_then(|idx| self.fields.get(idx))
    }

    /// Field values in schema order.
    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

/// A fully populated table. Never mutated after construction.
#[derive(Debug)]
pub struct TableInstance {
    name: String,
    layer: SourceLayer,
    schema: Arc<Schema>,
    records: Vec<Record>,
    id_mapping: IdMapping,
    id_index: HashMap<i64, usize>,
    known_schema: bool,
}

impl TableInstance {
    /// Build an instance. Records are ordered by source row index.
    pub fn new(
        name: &str,
        layer: SourceLayer,
        schema: Arc<Schema>,
        mut records: Vec<Record>,
        id_mapping: IdMapping,
        known_schema: bool,
    ) -> Self {
        records.sort_by_key(Record::row);

        let mut id_index = HashMap::with_capacity(records.len());
        for (pos, record) in records.iter().enumerate() {
            let id = match &id_mapping {
                IdMapping::RowIndex => Some(record.row as i64),
                IdMapping::Offset(offset) => Some(record.row as i64 + offset),
                IdMapping::Column(column) => record.get(column).and_then(FieldValue::as_int),
            };
            if let Some(id) = id {
                id_index.entry(id).or_insert(pos);
            }
        }

        Self {
            name: table_key(name),
            layer,
            schema,
            records,
            id_mapping,
            id_index,
            known_schema,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layer(&self) -> SourceLayer {
        self.layer
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn id_mapping(&self) -> &IdMapping {
        &self.id_mapping
    }

    /// Whether the table was built from a precompiled known schema.
    pub fn is_known_schema(&self) -> bool {
        self.known_schema
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Record at a position in the instance (not a declared id).
    pub fn record(&self, position: usize) -> Option<&Record> {
        self.records.get(position)
    }

    /// Record by declared id, according to the table's [`IdMapping`].
    pub fn get_by_id(&self, id: i64) -> Option<&Record> {
        self.id_index.get(&id).and_then(|&pos| self.records.get(pos))
    }

    /// Whether a declared id exists in this table.
    pub fn contains_id(&self, id: i64) -> bool {
        self.id_index.contains_key(&id)
    }
}

// ===========================================================================
// Store
// ===========================================================================

/// Name -> instance map with atomic publication. A reader sees either no
/// entry or a complete table.
#[derive(Debug, Default)]
pub struct TableStore {
    tables: RwLock<HashMap<String, Arc<TableInstance>>>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a fully built instance, replacing any previous one.
    pub fn publish(&self, instance: TableInstance) -> Arc<TableInstance> {
        let instance = Arc::new(instance);
        self.tables
            .write()
            .insert(instance.name().to_string(), Arc::clone(&instance));
        instance
    }

    pub fn get(&self, name: &str) -> Option<Arc<TableInstance>> {
        self.tables.read().get(&table_key(name)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.read().contains_key(&table_key(name))
    }

    /// Published table names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// All published instances, sorted by name.
    pub fn snapshot(&self) -> Vec<Arc<TableInstance>> {
        let mut tables: Vec<Arc<TableInstance>> = self.tables.read().values().cloned().collect();
        tables.sort_by(|a, b| a.name().cmp(b.name()));
        tables
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }

    pub fn clear(&self) {
        self.tables.write().clear();
    }
}

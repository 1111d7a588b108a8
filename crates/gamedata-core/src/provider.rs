//! The raw-data provider contract and a layered in-memory implementation.

use crate::table::{RowError, SourceLayer, TableSource, table_key};
use crate::value::{RawRow, Value};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A table name as listed by a provider, with the layer that wins for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableListing {
    pub name: String,
    pub layer: SourceLayer,
}

/// Supplies raw table sources and string-table resolution.
pub trait ResourceProvider: Send + Sync {
    /// Every table name available in any layer.
    fn list_tables(&self) -> Vec<TableListing>;

    /// The table after override layering, or `None` when absent.
    fn get_table_with_overrides(&self, name: &str) -> Option<Box<dyn TableSource>>;

    /// Resolve many string ids at once. Ids without an entry are omitted.
    fn resolve_strings_batch(&self, ids: &BTreeSet<u32>) -> HashMap<u32, String>;

    /// Resolve a single string id.
    fn resolve_string(&self, id: u32) -> Option<String>;
}

// ===========================================================================
// In-memory tables
// ===========================================================================

/// An in-memory table. Cloning is cheap; rows are shared.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    name: String,
    layer: SourceLayer,
    columns: Vec<String>,
    rows: Arc<Vec<Result<RawRow, String>>>,
}

impl MemoryTable {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: table_key(name),
            layer: SourceLayer::Base,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Arc::new(Vec::new()),
        }
    }

    /// Append a row given values in column order. Missing trailing values
    /// are filled with `Null`.
    pub fn with_row(mut self, values: Vec<Value>) -> Self {
        let mut row = RawRow::new();
        let mut values = values.into_iter();
        for column in &self.columns {
            row.insert(column.clone(), values.next().unwrap_or(Value::Null));
        }
        Arc::make_mut(&mut self.rows).push(Ok(row));
        self
    }

    /// Append a row that fails extraction with the given detail.
    pub fn with_malformed_row(mut self, detail: &str) -> Self {
        Arc::make_mut(&mut self.rows).push(Err(detail.to_string()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl TableSource for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer(&self) -> SourceLayer {
        self.layer
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn row(&self, index: usize) -> Result<RawRow, RowError> {
        match self.rows.get(index) {
            Some(Ok(row)) => Ok(row.clone()),
            Some(Err(detail)) => Err(RowError::Malformed {
                row: index,
                detail: detail.clone(),
            }),
            None => Err(RowError::OutOfRange {
                row: index,
                count: self.rows.len(),
            }),
        }
    }
}

// ===========================================================================
// In-memory provider
// ===========================================================================

/// A layered in-memory provider: an override table replaces the base table
/// of the same name. Counts string-resolution calls for inspection.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    base: BTreeMap<String, MemoryTable>,
    overrides: BTreeMap<String, MemoryTable>,
    strings: HashMap<u32, String>,
    batch_calls: AtomicUsize,
    single_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(mut self, table: MemoryTable) -> Self {
        self.insert(table, SourceLayer::Base);
        self
    }

    pub fn with_override(mut self, table: MemoryTable) -> Self {
        self.insert(table, SourceLayer::Override);
        self
    }

    pub fn with_string(mut self, id: u32, text: &str) -> Self {
        self.strings.insert(id, text.to_string());
        self
    }

    pub fn insert(&mut self, mut table: MemoryTable, layer: SourceLayer) {
        table.layer = layer;
        let key = table.name.clone();
        match layer {
            SourceLayer::Base => self.base.insert(key, table),
            SourceLayer::Override => self.overrides.insert(key, table),
        };
    }

    pub fn insert_string(&mut self, id: u32, text: &str) {
        self.strings.insert(id, text.to_string());
    }

    /// Number of `resolve_strings_batch` calls so far.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::Relaxed)
    }

    /// Number of `resolve_string` calls so far.
    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::Relaxed)
    }

    /// Requested id counts of every batch call, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }
}

impl ResourceProvider for MemoryProvider {
    fn list_tables(&self) -> Vec<TableListing> {
        let names: BTreeSet<&String> = self.base.keys().chain(self.overrides.keys()).collect();
        names
            .into_iter()
            .map(|name| TableListing {
                name: name.clone(),
                layer: if self.overrides.contains_key(name) {
                    SourceLayer::Override
                } else {
                    SourceLayer::Base
                },
            })
            .collect()
    }

    fn get_table_with_overrides(&self, name: &str) -> Option<Box<dyn TableSource>> {
        let key = table_key(name);
        self.overrides
            .get(&key)
            .or_else(|| self.base.get(&key))
            .map(|t| Box::new(t.clone()) as Box<dyn TableSource>)
    }

    fn resolve_strings_batch(&self, ids: &BTreeSet<u32>) -> HashMap<u32, String> {
        self.batch_calls.fetch_add(1, Ordering::Relaxed);
        self.batch_sizes.lock().push(ids.len());
        ids.iter()
            .filter_map(|id| self.strings.get(id).map(|s| (*id, s.clone())))
            .collect()
    }

    fn resolve_string(&self, id: u32) -> Option<String> {
        self.single_calls.fetch_add(1, Ordering::Relaxed);
        self.strings.get(&id).cloned()
    }
}

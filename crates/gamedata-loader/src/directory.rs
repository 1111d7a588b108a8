//! A layered [`ResourceProvider`] over directories of data files.
//!
//! Each table is one `<name>.ron|json|toml` file holding its column names
//! and rows. Override directories are consulted last-first, then the base
//! directory; the first directory holding a table supplies all of it. String
//! tables live in `strings.<ext>` in any layer; override entries win.

use crate::format::{FormatError, deserialize_file, find_data_file, list_data_files};
use gamedata_core::provider::{ResourceProvider, TableListing};
use gamedata_core::table::{RowError, SourceLayer, TableSource, table_key};
use gamedata_core::value::{RawRow, Value};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Base name of the string table file.
pub const STRINGS_FILE: &str = "strings";

// ===========================================================================
// File formats
// ===========================================================================

/// On-disk form of one table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableFile {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringEntry {
    pub id: u32,
    pub text: String,
}

/// On-disk form of a string table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StringsFile {
    #[serde(default)]
    pub strings: Vec<StringEntry>,
}

// ===========================================================================
// Table source
// ===========================================================================

#[derive(Debug, Clone)]
struct DirectoryTable {
    name: String,
    layer: SourceLayer,
    file: Arc<TableFile>,
}

impl TableSource for DirectoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer(&self) -> SourceLayer {
        self.layer
    }

    fn columns(&self) -> &[String] {
        &self.file.columns
    }

    fn row_count(&self) -> usize {
        self.file.rows.len()
    }

    fn row(&self, index: usize) -> Result<RawRow, RowError> {
        let values = self.file.rows.get(index).ok_or(RowError::OutOfRange {
            row: index,
            count: self.file.rows.len(),
        })?;
        if values.len() > self.file.columns.len() {
            return Err(RowError::Malformed {
                row: index,
                detail: format!(
                    "{} values for {} columns",
                    values.len(),
                    self.file.columns.len()
                ),
            });
        }
        let mut row = RawRow::new();
        for (pos, column) in self.file.columns.iter().enumerate() {
            row.insert(column.clone(), values.get(pos).cloned().unwrap_or(Value::Null));
        }
        Ok(row)
    }
}

// ===========================================================================
// Provider
// ===========================================================================

/// Reads tables lazily from a base directory and override directories.
/// Parsed tables are kept for the lifetime of the provider.
#[derive(Debug)]
pub struct DirectoryProvider {
    base: PathBuf,
    overrides: Vec<PathBuf>,
    strings: HashMap<u32, String>,
    tables: RwLock<HashMap<String, Option<DirectoryTable>>>,
}

impl DirectoryProvider {
    /// Open a provider. String tables are read eagerly; a malformed string
    /// table is an error.
    pub fn open(base: impl Into<PathBuf>, overrides: Vec<PathBuf>) -> Result<Self, FormatError> {
        let base = base.into();
        let mut strings = HashMap::new();
        for dir in std::iter::once(&base).chain(overrides.iter()) {
            if let Some(path) = find_data_file(dir, STRINGS_FILE)? {
                let file: StringsFile = deserialize_file(&path)?;
                debug!(path = %path.display(), entries = file.strings.len(), "string table read");
                strings.extend(file.strings.into_iter().map(|e| (e.id, e.text)));
            }
        }
        Ok(Self {
            base,
            overrides,
            strings,
            tables: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    /// Layers in lookup order: last override first, base last.
    fn layers(&self) -> impl Iterator<Item = (&Path, SourceLayer)> {
        self.overrides
            .iter()
            .rev()
            .map(|d| (d.as_path(), SourceLayer::Override))
            .chain(std::iter::once((self.base.as_path(), SourceLayer::Base)))
    }

    fn read_table(&self, key: &str) -> Option<DirectoryTable> {
        for (dir, layer) in self.layers() {
            let path = match find_data_file(dir, key) {
                Ok(Some(path)) => path,
                Ok(None) => continue,
                Err(e) => {
                    warn!(table = %key, error = %e, "table file unusable, treating as absent");
                    return None;
                }
            };
            return match deserialize_file::<TableFile>(&path) {
                Ok(file) => Some(DirectoryTable {
                    name: key.to_string(),
                    layer,
                    file: Arc::new(file),
                }),
                Err(e) => {
                    warn!(table = %key, error = %e, "table file unreadable, treating as absent");
                    None
                }
            };
        }
        None
    }
}

impl ResourceProvider for DirectoryProvider {
    fn list_tables(&self) -> Vec<TableListing> {
        let mut listing: BTreeMap<String, SourceLayer> = BTreeMap::new();
        for (dir, layer) in self.layers() {
            match list_data_files(dir) {
                Ok(names) => {
                    for name in names {
                        if name.eq_ignore_ascii_case(STRINGS_FILE) {
                            continue;
                        }
                        listing.entry(table_key(&name)).or_insert(layer);
                    }
                }
                Err(e) => warn!(dir = %dir.display(), error = %e, "cannot list data directory"),
            }
        }
        listing
            .into_iter()
            .map(|(name, layer)| TableListing { name, layer })
            .collect()
    }

    fn get_table_with_overrides(&self, name: &str) -> Option<Box<dyn TableSource>> {
        let key = table_key(name);
        if let Some(cached) = self.tables.read().get(&key) {
            return cached
                .clone()
                .map(|t| Box::new(t) as Box<dyn TableSource>);
        }
        let table = self.read_table(&key);
        self.tables.write().insert(key, table.clone());
        table.map(|t| Box::new(t) as Box<dyn TableSource>)
    }

    fn resolve_strings_batch(&self, ids: &BTreeSet<u32>) -> HashMap<u32, String> {
        ids.iter()
            .filter_map(|id| self.strings.get(id).map(|s| (*id, s.clone())))
            .collect()
    }

    fn resolve_string(&self, id: u32) -> Option<String> {
        self.strings.get(&id).cloned()
    }
}

//! Persisted cache of generated schema sources.
//!
//! Entries are keyed by table name and the structural hash of the table's
//! column shape. A hit parses the stored source; a miss (no entry, a stale
//! key or an unreadable file) generates, parses and stores new source.

use crate::error::LoadError;
use crate::persist::atomic_write;
use crate::synth::parse_schema_source;
use gamedata_core::schema::{GenericRecordType, Schema, SynthesisError};
use gamedata_core::table::table_key;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Subdirectory of the cache directory holding schema sources.
pub const SCHEMA_DIR: &str = "schemas";

/// On-disk form of one cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSchema {
    pub table: String,
    pub cache_key: String,
    pub source: String,
}

/// Counters for cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: usize,
    pub disk_hits: usize,
    pub generated: usize,
}

#[derive(Debug)]
pub struct CodeCache {
    dir: Option<PathBuf>,
    memo: Mutex<HashMap<String, (String, Schema)>>,
    memory_hits: AtomicUsize,
    disk_hits: AtomicUsize,
    generated: AtomicUsize,
}

impl CodeCache {
    /// A cache persisted under `cache_dir`, or memory-only when `None`.
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self {
            dir: cache_dir.map(|d| d.join(SCHEMA_DIR)),
            memo: Mutex::new(HashMap::new()),
            memory_hits: AtomicUsize::new(0),
            disk_hits: AtomicUsize::new(0),
            generated: AtomicUsize::new(0),
        }
    }

    /// Path of the entry for `table`, when persisted.
    pub fn entry_path(&self, table: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("{}.ron", table_key(table))))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            generated: self.generated.load(Ordering::Relaxed),
        }
    }

    /// Forget in-memory entries. Persisted entries are kept.
    pub fn clear_memory(&self) {
        self.memo.lock().clear();
    }

    /// Reuse the schema cached for `(table, cache_key)` or generate one.
    pub fn load_or_generate<F>(
        &self,
        table: &str,
        cache_key: &str,
        generate: F,
    ) -> Result<GenericRecordType, LoadError>
    where
        F: FnOnce() -> Result<String, SynthesisError>,
    {
        let key = table_key(table);

        if let Some((stored_key, schema)) = self.memo.lock().get(&key)
            && stored_key == cache_key
        {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(GenericRecordType::new(schema.clone()));
        }

        let path = self.entry_path(&key);
        if let Some(path) = &path
            && let Some(schema) = read_entry(path, &key, cache_key)
        {
            debug!(table = %key, "schema source reused from cache");
            self.disk_hits.fetch_add(1, Ordering::Relaxed);
            self.remember(&key, cache_key, &schema);
            return Ok(GenericRecordType::new(schema));
        }

        let source = generate().map_err(|source| LoadError::Synthesis {
            table: key.clone(),
            source,
        })?;
        let schema = parse_schema_source(&key, &source).map_err(|source| LoadError::Synthesis {
            table: key.clone(),
            source,
        })?;
        self.generated.fetch_add(1, Ordering::Relaxed);
        debug!(table = %key, columns = schema.columns().len(), "schema source generated");

        if let Some(path) = &path {
            let entry = CachedSchema {
                table: key.clone(),
                cache_key: cache_key.to_string(),
                source,
            };
            if let Err(e) = write_entry(path, &entry) {
                warn!(table = %key, error = %e, "failed to persist schema source");
            }
        }

        self.remember(&key, cache_key, &schema);
        Ok(GenericRecordType::new(schema))
    }

    fn remember(&self, table: &str, cache_key: &str, schema: &Schema) {
        self.memo
            .lock()
            .insert(table.to_string(), (cache_key.to_string(), schema.clone()));
    }
}

fn read_entry(path: &Path, table: &str, cache_key: &str) -> Option<Schema> {
    let text = std::fs::read_to_string(path).ok()?;
    let entry: CachedSchema = match ron::from_str(&text) {
        Ok(entry) => entry,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "schema cache entry unreadable");
            return None;
        }
    };
    if entry.table != table || entry.cache_key != cache_key {
        debug!(table = %table, "schema cache entry is stale");
        return None;
    }
    parse_schema_source(table, &entry.source).ok()
}

fn write_entry(path: &Path, entry: &CachedSchema) -> Result<(), LoadError> {
    let text = ron::ser::to_string_pretty(entry, ron::ser::PrettyConfig::default()).map_err(|e| {
        LoadError::Cache {
            path: path.to_path_buf(),
            detail: e.to_string(),
        }
    })?;
    atomic_write(path, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::column_shape_hash;
    use crate::synth::{InferringSynthesizer, SchemaSynthesizer};
    use gamedata_core::provider::MemoryTable;
    use gamedata_core::value::Value;
    use std::fs;

    fn make_test_dir(suffix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gamedata_code_cache_test_{suffix}_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn cleanup(dir: &Path) {
        let _ = fs::remove_dir_all(dir);
    }

    fn table(columns: &[&str]) -> MemoryTable {
        let values = columns.iter().map(|_| Value::Int(1)).collect();
        MemoryTable::new("mycontent_x", columns).with_row(values)
    }

    fn key_of(t: &MemoryTable) -> String {
        use gamedata_core::table::TableSource;
        column_shape_hash(t.columns())
    }

    #[test]
    fn persisted_source_is_reused_across_instances() {
        let dir = make_test_dir("reuse");
        let synth = InferringSynthesizer::new(["Name"]);
        let t = table(&["Label", "Name"]);
        let key = key_of(&t);

        let first = CodeCache::new(Some(dir.clone()));
        first
            .load_or_generate("mycontent_x", &key, || synth.generate("mycontent_x", &t))
            .unwrap();
        assert_eq!(first.stats().generated, 1);
        assert!(dir.join("schemas/mycontent_x.ron").exists());

        let second = CodeCache::new(Some(dir.clone()));
        let reused = second
            .load_or_generate("mycontent_x", &key, || panic!("should not regenerate"))
            .unwrap();
        assert_eq!(second.stats().disk_hits, 1);
        assert_eq!(reused.schema().columns().len(), 2);

        cleanup(&dir);
    }

    #[test]
    fn changed_shape_regenerates() {
        let dir = make_test_dir("regen");
        let synth = InferringSynthesizer::new(["Name"]);
        let cache = CodeCache::new(Some(dir.clone()));

        let v1 = table(&["Label", "Name"]);
        cache
            .load_or_generate("mycontent_x", &key_of(&v1), || synth.generate("mycontent_x", &v1))
            .unwrap();

        let v2 = table(&["Label", "Name", "Cost"]);
        let ty = cache
            .load_or_generate("mycontent_x", &key_of(&v2), || synth.generate("mycontent_x", &v2))
            .unwrap();
        assert_eq!(ty.schema().columns().len(), 3);
        assert_eq!(cache.stats().generated, 2);

        cleanup(&dir);
    }

    #[test]
    fn memory_only_cache_memoizes() {
        let cache = CodeCache::new(None);
        let synth = InferringSynthesizer::new(["Name"]);
        let t = table(&["Label"]);
        let key = key_of(&t);

        cache
            .load_or_generate("mycontent_x", &key, || synth.generate("mycontent_x", &t))
            .unwrap();
        cache
            .load_or_generate("mycontent_x", &key, || panic!("should not regenerate"))
            .unwrap();
        assert_eq!(
            cache.stats(),
            CacheStats {
                memory_hits: 1,
                disk_hits: 0,
                generated: 1,
            }
        );
        assert!(cache.entry_path("mycontent_x").is_none());
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let dir = make_test_dir("corrupt");
        fs::create_dir_all(dir.join(SCHEMA_DIR)).unwrap();
        fs::write(dir.join("schemas/mycontent_x.ron"), "(((garbage").unwrap();

        let synth = InferringSynthesizer::new(["Name"]);
        let t = table(&["Label"]);
        let cache = CodeCache::new(Some(dir.clone()));
        cache
            .load_or_generate("mycontent_x", &key_of(&t), || synth.generate("mycontent_x", &t))
            .unwrap();
        assert_eq!(cache.stats().generated, 1);

        let text = fs::read_to_string(dir.join("schemas/mycontent_x.ron")).unwrap();
        let entry: CachedSchema = ron::from_str(&text).unwrap();
        assert_eq!(entry.cache_key, key_of(&t));

        cleanup(&dir);
    }

    #[test]
    fn generation_failure_is_synthesis_error() {
        let cache = CodeCache::new(None);
        let err = cache
            .load_or_generate("broken", "k", || {
                Err(SynthesisError::NoColumns {
                    table: "broken".to_string(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, LoadError::Synthesis { .. }));
    }
}

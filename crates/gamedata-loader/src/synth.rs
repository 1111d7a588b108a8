//! Schema synthesis for tables without a precompiled schema.
//!
//! A [`SchemaSynthesizer`] produces schema *source* (a RON document for a
//! [`Schema`]) rather than a schema value, so the result can be persisted by
//! the [`CodeCache`](crate::code_cache::CodeCache) and reused across runs.

use crate::persist::column_shape_hash;
use gamedata_core::schema::{ColumnDef, Schema, SynthesisError};
use gamedata_core::table::TableSource;
use gamedata_core::value::{ColumnType, Value};
use std::collections::HashSet;

/// Generates schema source for a table.
pub trait SchemaSynthesizer: Send + Sync {
    fn generate(&self, table: &str, source: &dyn TableSource) -> Result<String, SynthesisError>;

    /// Key under which generated source is cached. Must change whenever
    /// `generate` would produce different source for `source`.
    fn cache_key(&self, table: &str, source: &dyn TableSource) -> String {
        let _ = table;
        column_shape_hash(source.columns())
    }
}

/// Parse schema source produced by a synthesizer.
pub fn parse_schema_source(table: &str, source: &str) -> Result<Schema, SynthesisError> {
    ron::from_str(source).map_err(|e| SynthesisError::InvalidSource {
        table: table.to_string(),
        detail: e.to_string(),
    })
}

// ===========================================================================
// Inference
// ===========================================================================

/// What a column's non-null values looked like.
#[derive(Debug, Clone, Copy, Default)]
struct ColumnEvidence {
    ints: usize,
    negatives: usize,
    floats: usize,
    texts: usize,
}

impl ColumnEvidence {
    fn observe(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        if let Some(i) = value.as_int() {
            self.ints += 1;
            if i < 0 {
                self.negatives += 1;
            }
        } else if value.as_float().is_some() {
            self.floats += 1;
        } else {
            self.texts += 1;
        }
    }

    fn infer(&self, string_like: bool) -> ColumnType {
        if self.texts > 0 || self.ints + self.floats == 0 {
            ColumnType::Text
        } else if self.floats > 0 {
            ColumnType::Float
        } else if string_like && self.negatives == 0 {
            ColumnType::StrRef
        } else {
            ColumnType::Int
        }
    }
}

/// Infers column types from the values present in the source. Integer
/// columns with a string-like name become string references.
#[derive(Debug, Clone)]
pub struct InferringSynthesizer {
    string_columns: HashSet<String>,
}

impl InferringSynthesizer {
    pub fn new<I, S>(string_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            string_columns: string_columns
                .into_iter()
                .map(|c| c.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Infer the schema without rendering it.
    pub fn infer(&self, table: &str, source: &dyn TableSource) -> Result<Schema, SynthesisError> {
        let columns = source.columns();
        if columns.is_empty() {
            return Err(SynthesisError::NoColumns {
                table: table.to_string(),
            });
        }
        let mut seen = HashSet::new();
        for column in columns {
            if !seen.insert(column.to_ascii_lowercase()) {
                return Err(SynthesisError::DuplicateColumn {
                    table: table.to_string(),
                    column: column.clone(),
                });
            }
        }

        let mut evidence = vec![ColumnEvidence::default(); columns.len()];
        for index in 0..source.row_count() {
            // Malformed rows are reported during population.
            let Ok(row) = source.row(index) else {
                continue;
            };
            for (pos, column) in columns.iter().enumerate() {
                if let Some(value) = row.get(column) {
                    evidence[pos].observe(value);
                }
            }
        }

        let defs = columns
            .iter()
            .zip(&evidence)
            .map(|(name, ev)| {
                let string_like = self.string_columns.contains(&name.to_ascii_lowercase());
                ColumnDef::new(name, ev.infer(string_like))
            })
            .collect();
        Ok(Schema::new(table, defs))
    }
}

impl SchemaSynthesizer for InferringSynthesizer {
    /// Hash of the inferred column types, so value changes that flip a
    /// column's type invalidate the cached source.
    fn cache_key(&self, table: &str, source: &dyn TableSource) -> String {
        match self.infer(table, source) {
            Ok(schema) => {
                let typed: Vec<String> = schema
                    .columns()
                    .iter()
                    .map(|c| format!("{}:{:?}", c.name, c.ty))
                    .collect();
                column_shape_hash(&typed)
            }
            // Generation fails the same way; nothing gets cached.
            Err(_) => column_shape_hash(source.columns()),
        }
    }

    fn generate(&self, table: &str, source: &dyn TableSource) -> Result<String, SynthesisError> {
        let schema = self.infer(table, source)?;
        ron::ser::to_string_pretty(&schema, ron::ser::PrettyConfig::default()).map_err(|e| {
            SynthesisError::Render {
                table: table.to_string(),
                detail: e.to_string(),
            }
        })
    }
}

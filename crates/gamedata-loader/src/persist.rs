//! On-disk cache helpers: atomic writes, structural hashing and the
//! relationship snapshot.

use crate::error::LoadError;
use gamedata_core::relationship::ValidationReport;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// File name of the relationship snapshot inside the cache directory.
pub const SNAPSHOT_FILE: &str = "relationships.json";

/// Bumped whenever the snapshot layout changes; older files are misses.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ===========================================================================
// Atomic writes
// ===========================================================================

/// Write `contents` to `<path>.tmp`, then rename over `path`.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), LoadError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|s| s.to_str()).unwrap_or("tmp")
    ));
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path).map_err(|e| LoadError::Cache {
        path: path.to_path_buf(),
        detail: format!("rename from {} failed: {e}", tmp_path.display()),
    })
}

// ===========================================================================
// Hashing
// ===========================================================================

/// Hash of one table's column shape (names, case-insensitive, in order).
pub fn column_shape_hash(columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    for column in columns {
        hasher.update(column.trim().to_ascii_lowercase().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Fingerprint over every table name and its columns. Independent of the
/// order tables are given in.
pub fn structural_fingerprint<'a, I>(tables: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let mut entries: Vec<(String, String)> = tables
        .into_iter()
        .map(|(name, columns)| (name.to_ascii_lowercase(), column_shape_hash(columns)))
        .collect();
    entries.sort();

    let mut hasher = Sha256::new();
    for (name, shape) in entries {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(shape.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

// ===========================================================================
// Relationship snapshot
// ===========================================================================

/// A validation report together with the structure it was computed for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipSnapshot {
    pub format_version: u32,
    pub fingerprint: String,
    pub report: ValidationReport,
}

impl RelationshipSnapshot {
    pub fn new(fingerprint: String, report: ValidationReport) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            fingerprint,
            report,
        }
    }
}

/// Read a snapshot. Missing, unreadable or outdated files are misses.
pub fn load_snapshot(path: &Path) -> Option<RelationshipSnapshot> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice::<RelationshipSnapshot>(&bytes) {
        Ok(snapshot) if snapshot.format_version == SNAPSHOT_FORMAT_VERSION => Some(snapshot),
        Ok(snapshot) => {
            debug!(
                path = %path.display(),
                version = snapshot.format_version,
                "relationship snapshot has an old format, ignoring"
            );
            None
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "relationship snapshot unreadable, ignoring");
            None
        }
    }
}

pub fn save_snapshot(path: &Path, snapshot: &RelationshipSnapshot) -> Result<(), LoadError> {
    let json = serde_json::to_vec_pretty(snapshot).map_err(|e| LoadError::Cache {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    atomic_write(path, &json)
}

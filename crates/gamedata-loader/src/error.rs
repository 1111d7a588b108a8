use crate::format::FormatError;
use gamedata_core::schema::SynthesisError;
use std::fmt;
use std::path::PathBuf;

/// A table that could not be built at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralFailure {
    pub table: String,
    pub reason: String,
}

impl fmt::Display for StructuralFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.table, self.reason)
    }
}

fn join_failures(failures: &[StructuralFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors that can occur while loading game data.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("invalid configuration in {path}: {detail}")]
    Config { path: PathBuf, detail: String },

    #[error("table '{table}' is not available")]
    TableAbsent { table: String },

    #[error("schema synthesis failed for '{table}': {source}")]
    Synthesis {
        table: String,
        #[source]
        source: SynthesisError,
    },

    #[error("table '{table}': all {rejected} rows rejected, first: {first}")]
    Construction {
        table: String,
        rejected: usize,
        first: String,
    },

    #[error("cache file {path}: {detail}")]
    Cache { path: PathBuf, detail: String },

    #[error("{} table(s) failed to load: {}", .failures.len(), join_failures(.failures))]
    Structural { failures: Vec<StructuralFailure> },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LoadError {
    /// Whether this error concerns a single table rather than the whole run.
    pub fn is_table_local(&self) -> bool {
        matches!(
            self,
            LoadError::TableAbsent { .. }
                | LoadError::Synthesis { .. }
                | LoadError::Construction { .. }
        )
    }
}

//! Loading progress reported to an observer callback.

use std::fmt;
use std::sync::Arc;

/// Pipeline stage a progress update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadStage {
    Discovery,
    Ordering,
    Synthesis,
    Population,
    Finalize,
    Complete,
}

impl LoadStage {
    /// Percent range covered by the stage.
    pub fn span(self) -> (u8, u8) {
        match self {
            LoadStage::Discovery => (0, 10),
            LoadStage::Ordering => (10, 15),
            LoadStage::Synthesis => (30, 45),
            LoadStage::Population => (60, 90),
            LoadStage::Finalize => (90, 99),
            LoadStage::Complete => (100, 100),
        }
    }
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadStage::Discovery => "discovery",
            LoadStage::Ordering => "ordering",
            LoadStage::Synthesis => "schema synthesis",
            LoadStage::Population => "population",
            LoadStage::Finalize => "finalize",
            LoadStage::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// One progress update. Ephemeral.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadingProgress {
    pub stage: LoadStage,
    pub percent: u8,
    pub message: String,
}

impl LoadingProgress {
    /// Progress `done` of `total` through `stage`, mapped into the stage's span.
    pub fn within(stage: LoadStage, done: usize, total: usize, message: impl Into<String>) -> Self {
        let (lo, hi) = stage.span();
        let percent = if total == 0 {
            hi
        } else {
            let fraction = done.min(total) as f64 / total as f64;
            lo + ((hi - lo) as f64 * fraction).round() as u8
        };
        Self {
            stage,
            percent,
            message: message.into(),
        }
    }
}

/// Observer invoked synchronously from the loading thread.
pub type ProgressCallback = Arc<dyn Fn(&LoadingProgress) + Send + Sync>;

//! Loads game data tables into a shared, guarded [`DataContext`].
//!
//! A [`LoadPipeline`] discovers tables through a
//! [`ResourceProvider`](gamedata_core::provider::ResourceProvider), orders
//! them by detected references, picks or generates a schema per table,
//! populates each table in one batch and validates relationships once the
//! data is in place. [`DirectoryProvider`] reads tables from RON, TOML or
//! JSON files laid out in base and override directories.

pub mod code_cache;
pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod format;
pub mod known;
pub mod persist;
pub mod pipeline;
pub mod synth;

pub use config::{GuardSettings, LoaderConfig, load_config, load_config_from_dir};
pub use context::DataContext;
pub use directory::DirectoryProvider;
pub use error::{LoadError, StructuralFailure};
pub use format::{Format, FormatError};
pub use pipeline::{LoadPipeline, LoadSummary, PopulateStats};

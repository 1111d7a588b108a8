//! Gamedata Core -- the data model and building blocks of the game-data
//! loading pipeline.
//!
//! This crate holds everything the loader orchestrates but does not itself
//! touch the filesystem: raw and typed values, schemas and record
//! construction, published table instances, the provider contract, the
//! relationship analyzer, the dependency graph and the access guard.
//!
//! # Publication Model
//!
//! Tables are built fully off to the side and then published into a
//! [`table::TableStore`] as an `Arc`. A reader either sees no entry for a
//! table or a complete one:
//!
//! ```rust,ignore
//! let instance = TableInstance::new("feat", layer, schema, records, IdMapping::RowIndex, false);
//! store.publish(instance);
//! let feat = store.get("feat").unwrap();
//! ```
//!
//! # Key Types
//!
//! - [`provider::ResourceProvider`] -- Source of raw tables and string-table
//!   text. [`provider::MemoryProvider`] is the in-memory implementation.
//! - [`schema::RecordType`] -- Known (precompiled) or dynamic (generated)
//!   schema plus a batch row constructor.
//! - [`table::TableInstance`] -- Immutable, fully constructed table.
//! - [`relationship::RelationshipAnalyzer`] -- Detects cross-table
//!   references, orders tables and validates reference values.
//! - [`graph::DependencyGraph`] -- Cycle-tolerant topological ordering.
//! - [`guard::AccessGuard`] -- Retry/cooldown/blacklist circuit breaker.

pub mod graph;
pub mod guard;
pub mod progress;
pub mod provider;
pub mod relationship;
pub mod schema;
pub mod table;
pub mod value;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

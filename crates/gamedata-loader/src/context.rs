//! The shared query surface over loaded data.
//!
//! A [`DataContext`] is built once at startup, shared by `Arc` between the
//! loading thread and readers, and queried through the access guard. Queries
//! never fail loudly: a denied or unsuccessful lookup is `None`.

use gamedata_core::guard::{AccessGuard, AccessKey, GuardConfig};
use gamedata_core::relationship::ValidationReport;
use gamedata_core::table::{Record, TableInstance, TableStore};
use parking_lot::RwLock;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

#[derive(Debug, Default)]
pub struct DataContext {
    store: TableStore,
    guard: AccessGuard,
    report: RwLock<Option<ValidationReport>>,
    ready: AtomicBool,
}

impl DataContext {
    pub fn new(guard: GuardConfig) -> Self {
        Self::with_guard(AccessGuard::new(guard))
    }

    pub fn with_guard(guard: AccessGuard) -> Self {
        Self {
            store: TableStore::new(),
            guard,
            report: RwLock::new(None),
            ready: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn guard(&self) -> &AccessGuard {
        &self.guard
    }

    /// A published table. Asking for a table that is not (yet) published
    /// counts against the table's retry budget.
    pub fn get_table(&self, name: &str) -> Option<Arc<TableInstance>> {
        self.guard
            .guarded(&AccessKey::table(name), || Ok::<_, Infallible>(self.store.get(name)))
    }

    /// A record by declared id. A missing table is a failure; a missing id in
    /// a published table is a legitimate "not found".
    pub fn get_by_id(&self, name: &str, id: i64) -> Option<Record> {
        self.guard.guarded(&AccessKey::by_id(name, id), || {
            let table = self.store.get(name).ok_or("table not loaded")?;
            Ok::<_, &str>(table.get_by_id(id).cloned())
        })
    }

    /// Published table names, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.store.names()
    }

    /// True once a full load has been finalized.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn validation_report(&self) -> Option<ValidationReport> {
        self.report.read().clone()
    }

    pub(crate) fn set_report(&self, report: ValidationReport) {
        *self.report.write() = Some(report);
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Drop all loaded data, guard state and the report.
    pub fn teardown(&self) {
        self.set_ready(false);
        self.store.clear();
        self.guard.reset_all();
        *self.report.write() = None;
        info!("data context torn down");
    }
}

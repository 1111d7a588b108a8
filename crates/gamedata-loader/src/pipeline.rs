//! The loading pipeline: discovery, ordering, schema synthesis, batched
//! population and relationship validation.
//!
//! # Stages
//!
//! [`LoadPipeline::run`] executes, in order:
//! 1. **Discover** -- curated tables plus character-relevant custom tables.
//! 2. **Order** -- structural relationship detection and a load order.
//! 3. **Synthesize** -- a known or generated [`RecordType`] per table.
//! 4. **Populate** -- rows, one batched string lookup, one batch construct,
//!    atomic publication.
//! 5. **Finalize** -- relationship validation on real data, persisted with a
//!    structural fingerprint and reused while the fingerprint is unchanged.
//!
//! One bad row is skipped; one absent table is simply missing; one table
//! whose every row is rejected is a structural failure that is reported
//! after the remaining tables have loaded.

use crate::code_cache::CodeCache;
use crate::config::LoaderConfig;
use crate::context::DataContext;
use crate::error::{LoadError, StructuralFailure};
use crate::known;
use crate::persist::{
    RelationshipSnapshot, SNAPSHOT_FILE, load_snapshot, save_snapshot, structural_fingerprint,
};
use crate::synth::{InferringSynthesizer, SchemaSynthesizer};
use gamedata_core::guard::AccessKey;
use gamedata_core::progress::{LoadStage, LoadingProgress, ProgressCallback};
use gamedata_core::provider::ResourceProvider;
use gamedata_core::relationship::{
    ColumnNameAnalyzer, RelationshipAnalyzer, TableProfile, ValidationReport,
};
use gamedata_core::schema::{KnownRecordType, RecordType, StringCache};
use gamedata_core::table::{RowError, TableDescriptor, TableInstance, TableSource, table_key};
use gamedata_core::value::RawRow;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Name of the background loading thread.
pub const LOADER_THREAD_NAME: &str = "gamedata-loader";

// ===========================================================================
// Summaries
// ===========================================================================

/// Totals for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSummary {
    pub tables_loaded: usize,
    pub tables_absent: usize,
    pub rows_loaded: usize,
    pub rows_skipped: usize,
    pub strings_resolved: usize,
    pub report_from_snapshot: bool,
    pub elapsed: Duration,
}

/// Result of populating one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulateStats {
    pub rows_loaded: usize,
    pub rows_skipped: usize,
    pub strings_requested: usize,
    pub strings_resolved: usize,
}

// ===========================================================================
// Pipeline
// ===========================================================================

pub struct LoadPipeline {
    config: LoaderConfig,
    provider: Arc<dyn ResourceProvider>,
    context: Arc<DataContext>,
    analyzer: Box<dyn RelationshipAnalyzer>,
    synthesizer: Box<dyn SchemaSynthesizer>,
    code_cache: CodeCache,
    progress: Option<ProgressCallback>,
    string_columns: HashSet<String>,

    /// Sources fetched during the current run, by table key.
    sources: HashMap<String, Arc<dyn TableSource>>,
    /// Table names in the order they were last scheduled.
    load_order: Vec<String>,
    /// Columns of every scheduled table, including ones never published.
    scheduled_columns: HashMap<String, Vec<String>>,
    last_snapshot: Option<RelationshipSnapshot>,
    summary: LoadSummary,
}

impl LoadPipeline {
    /// A pipeline with the default analyzer and synthesizer.
    pub fn new(
        config: LoaderConfig,
        provider: Arc<dyn ResourceProvider>,
        context: Arc<DataContext>,
    ) -> Self {
        let analyzer = ColumnNameAnalyzer::with_hints(config.relationship_hints.clone());
        let synthesizer = InferringSynthesizer::new(&config.string_columns);
        let code_cache = CodeCache::new(config.cache_dir.clone());
        let string_columns = config.string_column_set();
        Self {
            config,
            provider,
            context,
            analyzer: Box::new(analyzer),
            synthesizer: Box::new(synthesizer),
            code_cache,
            progress: None,
            string_columns,
            sources: HashMap::new(),
            load_order: Vec::new(),
            scheduled_columns: HashMap::new(),
            last_snapshot: None,
            summary: LoadSummary::default(),
        }
    }

    pub fn with_analyzer(mut self, analyzer: Box<dyn RelationshipAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Box<dyn SchemaSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&LoadingProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<DataContext> {
        &self.context
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    /// Summary of the most recent run.
    pub fn summary(&self) -> &LoadSummary {
        &self.summary
    }

    /// Table names in the most recently computed load order.
    pub fn load_order(&self) -> &[String] {
        &self.load_order
    }

    fn emit(&self, progress: LoadingProgress) {
        if let Some(callback) = &self.progress {
            callback(&progress);
        }
    }

    fn source(&mut self, name: &str) -> Option<Arc<dyn TableSource>> {
        let key = table_key(name);
        if let Some(source) = self.sources.get(&key) {
            return Some(Arc::clone(source));
        }
        let source: Arc<dyn TableSource> = Arc::from(self.provider.get_table_with_overrides(&key)?);
        self.sources.insert(key, Arc::clone(&source));
        Some(source)
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        self.config.cache_dir.as_ref().map(|d| d.join(SNAPSHOT_FILE))
    }

    // -----------------------------------------------------------------------
    // Discover
    // -----------------------------------------------------------------------

    /// Candidate tables: the curated set in configuration order, then
    /// character-relevant custom tables sorted by name. Absent tables are
    /// skipped.
    pub fn discover(&mut self) -> Vec<TableDescriptor> {
        self.sources.clear();

        let mut custom: Vec<String> = self
            .provider
            .list_tables()
            .into_iter()
            .map(|listing| table_key(&listing.name))
            .filter(|name| self.config.is_character_relevant(name))
            .collect();
        custom.sort();

        let curated: Vec<String> = self.config.always_load.iter().map(|n| table_key(n)).collect();

        let mut seen = HashSet::new();
        let mut descriptors = Vec::new();
        let mut absent = 0;
        for name in curated.into_iter().chain(custom) {
            if !seen.insert(name.clone()) {
                continue;
            }
            match self.source(&name) {
                Some(source) => descriptors.push(TableDescriptor {
                    name,
                    layer: source.layer(),
                    row_count: source.row_count(),
                }),
                None => {
                    debug!(table = %name, "table absent, skipping");
                    absent += 1;
                }
            }
        }

        self.summary.tables_absent = absent;
        info!(tables = descriptors.len(), absent, "discovery complete");
        self.emit(LoadingProgress::within(
            LoadStage::Discovery,
            1,
            1,
            format!("Discovered {} tables", descriptors.len()),
        ));
        descriptors
    }

    // -----------------------------------------------------------------------
    // Order
    // -----------------------------------------------------------------------

    /// Order descriptors so that referenced tables load first. Falls back to
    /// the priority list plus ascending row count when analysis fails.
    pub fn order(&mut self, descriptors: &[TableDescriptor]) -> Vec<TableDescriptor> {
        let mut profiles = Vec::with_capacity(descriptors.len());
        for d in descriptors {
            let columns = self
                .source(&d.name)
                .map(|s| s.columns().to_vec())
                .unwrap_or_default();
            profiles.push(TableProfile::structural(&d.name, columns, d.row_count));
        }

        let names = match self
            .analyzer
            .detect(&profiles)
            .and_then(|()| self.analyzer.load_order())
        {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "relationship analysis failed, using fallback order");
                fallback_order(&self.config.priority_tables, descriptors)
            }
        };

        let mut by_name: HashMap<&str, &TableDescriptor> =
            descriptors.iter().map(|d| (d.name.as_str(), d)).collect();
        let mut ordered: Vec<TableDescriptor> = names
            .iter()
            .filter_map(|name| by_name.remove(name.as_str()).cloned())
            .collect();
        // Anything the analyzer left out keeps its discovery position at the end.
        ordered.extend(
            descriptors
                .iter()
                .filter(|d| by_name.contains_key(d.name.as_str()))
                .cloned(),
        );

        self.load_order = ordered.iter().map(|d| d.name.clone()).collect();
        self.scheduled_columns = profiles
            .into_iter()
            .map(|p| (p.name, p.columns))
            .collect();
        info!(tables = ordered.len(), "load order computed");
        self.emit(LoadingProgress::within(
            LoadStage::Ordering,
            1,
            1,
            "Computed load order",
        ));
        ordered
    }

    // -----------------------------------------------------------------------
    // Synthesize
    // -----------------------------------------------------------------------

    /// The record type for a table: its precompiled schema when the source
    /// has exactly the known columns, otherwise a generated schema from the
    /// code cache.
    pub fn synthesize(&mut self, descriptor: &TableDescriptor) -> Result<RecordType, LoadError> {
        let source = self
            .source(&descriptor.name)
            .ok_or_else(|| LoadError::TableAbsent {
                table: descriptor.name.clone(),
            })?;

        if let Some(def) = known::lookup(&descriptor.name) {
            if known::matches_shape(def, source.columns()) {
                return Ok(RecordType::Known(KnownRecordType::new(def)));
            }
            debug!(table = %descriptor.name, "columns differ from known schema, generating");
        }

        let synthesizer = &self.synthesizer;
        let cache_key = synthesizer.cache_key(&descriptor.name, source.as_ref());
        let generic = self
            .code_cache
            .load_or_generate(&descriptor.name, &cache_key, || {
                synthesizer.generate(&descriptor.name, source.as_ref())
            })?;
        Ok(RecordType::Dynamic(generic))
    }

    // -----------------------------------------------------------------------
    // Populate
    // -----------------------------------------------------------------------

    /// Build and publish one table.
    pub fn populate(
        &mut self,
        descriptor: &TableDescriptor,
        record_type: &RecordType,
    ) -> Result<PopulateStats, LoadError> {
        let started = Instant::now();
        let key = table_key(&descriptor.name);
        let source = self
            .source(&key)
            .ok_or_else(|| LoadError::TableAbsent { table: key.clone() })?;

        let mut rows: Vec<(usize, RawRow)> = Vec::with_capacity(source.row_count());
        let mut extraction_errors: Vec<RowError> = Vec::new();
        for index in 0..source.row_count() {
            match source.row(index) {
                Ok(row) => rows.push((index, row)),
                Err(e) => {
                    warn!(table = %key, error = %e, "row unreadable, skipping");
                    extraction_errors.push(e);
                }
            }
        }

        let ids = self.collect_string_ids(&rows);
        let strings = self.resolve_strings(&key, &ids);

        let outcome = record_type.construct_batch(&rows, &strings);
        for e in &outcome.rejected {
            warn!(table = %key, error = %e, "row rejected, skipping");
        }

        let skipped = extraction_errors.len() + outcome.rejected.len();
        // Unreadable rows never reach construction, so a table of only
        // unreadable rows is a failure with an empty outcome.
        if outcome.is_total_failure() || (rows.is_empty() && !extraction_errors.is_empty()) {
            let first = outcome
                .rejected
                .first()
                .or(extraction_errors.first())
                .map(ToString::to_string)
                .unwrap_or_default();
            error!(table = %key, rejected = skipped, "every row rejected, table not published");
            return Err(LoadError::Construction {
                table: key,
                rejected: skipped,
                first,
            });
        }

        let stats = PopulateStats {
            rows_loaded: outcome.records.len(),
            rows_skipped: skipped,
            strings_requested: ids.len(),
            strings_resolved: strings.len(),
        };
        let instance = TableInstance::new(
            &key,
            source.layer(),
            Arc::clone(record_type.schema()),
            outcome.records,
            self.config.id_mapping(&key),
            record_type.is_known(),
        );
        self.context.store().publish(instance);

        debug!(
            table = %key,
            rows = stats.rows_loaded,
            skipped = stats.rows_skipped,
            strings = stats.strings_resolved,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "table published"
        );
        Ok(stats)
    }

    /// Distinct string ids referenced by string-like columns across all rows.
    fn collect_string_ids(&self, rows: &[(usize, RawRow)]) -> BTreeSet<u32> {
        let mut ids = BTreeSet::new();
        for (_, row) in rows {
            for (column, value) in row {
                if !self.string_columns.contains(&column.to_ascii_lowercase()) {
                    continue;
                }
                if let Some(id) = value.as_int().and_then(|i| u32::try_from(i).ok()) {
                    ids.insert(id);
                }
            }
        }
        ids
    }

    /// One guarded batch call, then guarded single lookups for whatever the
    /// batch did not return.
    fn resolve_strings(&self, table: &str, ids: &BTreeSet<u32>) -> StringCache {
        if ids.is_empty() {
            return StringCache::new();
        }
        let guard = self.context.guard();
        let provider = &self.provider;

        let mut cache = guard
            .guarded(&AccessKey::strings(table, None), || {
                Ok::<_, Infallible>(Some(provider.resolve_strings_batch(ids)))
            })
            .unwrap_or_default();

        let missing: Vec<u32> = ids
            .iter()
            .filter(|id| !cache.contains_key(id))
            .copied()
            .collect();
        if !missing.is_empty() {
            let _quiet = guard.quiet();
            for id in &missing {
                let text = guard.guarded(&AccessKey::strings(table, Some(*id)), || {
                    Ok::<_, Infallible>(provider.resolve_string(*id))
                });
                if let Some(text) = text {
                    cache.insert(*id, text);
                }
            }
            debug!(
                table = %table,
                requested = ids.len(),
                missing = missing.len(),
                "string batch incomplete, used single lookups"
            );
        }
        cache
    }

    // -----------------------------------------------------------------------
    // Finalize
    // -----------------------------------------------------------------------

    /// Validate relationships over the published tables, or reuse the
    /// previous report while the structural fingerprint is unchanged. Marks
    /// the context ready and the guard warm.
    ///
    /// Scheduled tables that were never published take part structurally, so
    /// references into them are reported as missing.
    pub fn finalize(&mut self) -> ValidationReport {
        self.emit(LoadingProgress::within(
            LoadStage::Finalize,
            0,
            1,
            "Validating relationships",
        ));

        let mut tables = self.context.store().snapshot();
        let position: HashMap<&str, usize> = self
            .load_order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        tables.sort_by_key(|t| {
            let pos = position.get(t.name()).copied().unwrap_or(usize::MAX);
            (pos, t.name().to_string())
        });

        let published: HashSet<&str> = tables.iter().map(|t| t.name()).collect();
        let unpublished: Vec<TableProfile> = self
            .load_order
            .iter()
            .filter(|name| !published.contains(name.as_str()))
            .map(|name| {
                let columns = self.scheduled_columns.get(name).cloned().unwrap_or_default();
                TableProfile::structural(name, columns, 0)
            })
            .collect();

        let mut shapes: Vec<(String, Vec<String>)> = tables
            .iter()
            .map(|t| {
                let columns = t.schema().columns().iter().map(|c| c.name.clone()).collect();
                (t.name().to_string(), columns)
            })
            .collect();
        shapes.extend(
            unpublished
                .iter()
                .map(|p| (format!("{}#unpublished", p.name), p.columns.clone())),
        );
        let fingerprint =
            structural_fingerprint(shapes.iter().map(|(n, c)| (n.as_str(), c.as_slice())));

        let snapshot_path = self.snapshot_path();
        let cached = self
            .last_snapshot
            .clone()
            .filter(|s| s.fingerprint == fingerprint)
            .or_else(|| {
                snapshot_path
                    .as_deref()
                    .and_then(load_snapshot)
                    .filter(|s| s.fingerprint == fingerprint)
            });

        let (report, from_snapshot) = match cached {
            Some(snapshot) => {
                info!("structure unchanged, reusing relationship report");
                (snapshot.report, true)
            }
            None => {
                let mut profiles: Vec<TableProfile> =
                    tables.into_iter().map(TableProfile::populated).collect();
                profiles.extend(unpublished);
                let report = match self.analyzer.detect(&profiles) {
                    Ok(()) => self.analyzer.validate(),
                    Err(e) => {
                        warn!(error = %e, "relationship validation failed");
                        ValidationReport {
                            dependency_order: self.load_order.clone(),
                            ..ValidationReport::default()
                        }
                    }
                };
                let snapshot = RelationshipSnapshot::new(fingerprint.clone(), report.clone());
                if let Some(path) = &snapshot_path
                    && let Err(e) = save_snapshot(path, &snapshot)
                {
                    warn!(error = %e, "failed to persist relationship report");
                }
                (report, false)
            }
        };

        if !report.is_clean() {
            warn!(
                broken = report.broken_references.len(),
                missing_tables = report.missing_tables.len(),
                "relationship validation found unresolved references"
            );
        }
        info!(
            relationships = report.total_relationships,
            valid = report.valid_relationships,
            from_snapshot,
            "relationships validated"
        );

        self.last_snapshot = Some(RelationshipSnapshot::new(fingerprint, report.clone()));
        self.summary.report_from_snapshot = from_snapshot;
        self.context.set_report(report.clone());
        self.context.guard().mark_warm();
        self.context.set_ready(true);

        self.emit(LoadingProgress::within(
            LoadStage::Complete,
            1,
            1,
            "Game data loaded",
        ));
        report
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Run every stage. Table-level failures are collected and returned as
    /// [`LoadError::Structural`] after finalize; everything that loaded stays
    /// queryable. Errors not tied to one table abort the run.
    pub fn run(&mut self) -> Result<LoadSummary, LoadError> {
        let started = Instant::now();
        self.summary = LoadSummary::default();
        info!("game data load started");

        let discovered = self.discover();
        let ordered = self.order(&discovered);
        let mut failures = Vec::new();

        let total = ordered.len();
        let mut prepared = Vec::with_capacity(total);
        for (i, descriptor) in ordered.iter().enumerate() {
            match self.synthesize(descriptor) {
                Ok(record_type) => prepared.push((descriptor, record_type)),
                Err(LoadError::TableAbsent { table }) => {
                    debug!(table = %table, "table vanished before synthesis");
                    self.summary.tables_absent += 1;
                }
                Err(e) if !e.is_table_local() => return Err(e),
                Err(e) => {
                    error!(table = %descriptor.name, error = %e, "schema synthesis failed");
                    failures.push(StructuralFailure {
                        table: descriptor.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            self.emit(LoadingProgress::within(
                LoadStage::Synthesis,
                i + 1,
                total,
                format!("Prepared schema for {}", descriptor.name),
            ));
        }

        let total = prepared.len();
        for (i, (descriptor, record_type)) in prepared.iter().enumerate() {
            match self.populate(descriptor, record_type) {
                Ok(stats) => {
                    self.summary.tables_loaded += 1;
                    self.summary.rows_loaded += stats.rows_loaded;
                    self.summary.rows_skipped += stats.rows_skipped;
                    self.summary.strings_resolved += stats.strings_resolved;
                }
                Err(LoadError::TableAbsent { table }) => {
                    debug!(table = %table, "table vanished before population");
                    self.summary.tables_absent += 1;
                }
                Err(e) if !e.is_table_local() => return Err(e),
                Err(e) => failures.push(StructuralFailure {
                    table: descriptor.name.clone(),
                    reason: e.to_string(),
                }),
            }
            self.emit(LoadingProgress::within(
                LoadStage::Population,
                i + 1,
                total,
                format!("Loaded {}", descriptor.name),
            ));
            if self.config.yield_every > 0 && (i + 1) % self.config.yield_every == 0 {
                std::thread::yield_now();
            }
        }

        self.finalize();
        self.sources.clear();
        self.summary.elapsed = started.elapsed();

        info!(
            tables = self.summary.tables_loaded,
            rows = self.summary.rows_loaded,
            skipped = self.summary.rows_skipped,
            failed = failures.len(),
            elapsed_ms = self.summary.elapsed.as_millis() as u64,
            "game data load complete"
        );

        if failures.is_empty() {
            Ok(self.summary.clone())
        } else {
            Err(LoadError::Structural { failures })
        }
    }

    /// Run the pipeline on its own named thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<Result<LoadSummary, LoadError>>> {
        std::thread::Builder::new()
            .name(LOADER_THREAD_NAME.to_string())
            .spawn(move || {
                let mut pipeline = self;
                pipeline.run()
            })
    }
}

/// Priority tables first (in configured order), then the rest by ascending
/// row count, ties by name.
fn fallback_order(priority: &[String], descriptors: &[TableDescriptor]) -> Vec<String> {
    let priority: Vec<String> = priority.iter().map(|p| table_key(p)).collect();
    let mut order: Vec<String> = priority
        .iter()
        .filter(|p| descriptors.iter().any(|d| &d.name == *p))
        .cloned()
        .collect();

    let mut rest: Vec<&TableDescriptor> = descriptors
        .iter()
        .filter(|d| !priority.contains(&d.name))
        .collect();
    rest.sort_by(|a, b| a.row_count.cmp(&b.row_count).then_with(|| a.name.cmp(&b.name)));
    order.extend(rest.into_iter().map(|d| d.name.clone()));
    order
}

// ===========================================================================
// Tests
// ===========================================================================

//! End-to-end loading over an in-memory provider.
//!
//! Covers override-only custom content, batched string resolution, report
//! reuse across finalize calls, structural failures, the fallback order and
//! background loading with progress reporting.

use gamedata_core::guard::GuardConfig;
use gamedata_core::progress::{LoadStage, LoadingProgress};
use gamedata_core::provider::{MemoryProvider, MemoryTable};
use gamedata_core::relationship::{
    AnalyzerError, ColumnNameAnalyzer, RelationshipAnalyzer, TableProfile, ValidationReport,
};
use gamedata_core::table::SourceLayer;
use gamedata_core::test_utils::{base_provider, instance, labelled_table};
use gamedata_core::value::Value;
use gamedata_loader::{DataContext, LoadError, LoadPipeline, LoaderConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// ===========================================================================
// Helpers
// ===========================================================================

fn context() -> Arc<DataContext> {
    Arc::new(DataContext::new(GuardConfig::default()))
}

/// Base tables plus an override-only `mycontent_x` referencing `classes`.
fn provider_with_custom_content() -> MemoryProvider {
    base_provider()
        .with_override(
            MemoryTable::new("mycontent_x", &["Label", "Name", "ClassID"])
                .with_row(vec![Value::from("x_0"), Value::Int(900), Value::Int(0)])
                .with_row(vec![Value::from("x_1"), Value::Int(901), Value::Int(2)])
                .with_row(vec![Value::from("x_2"), Value::Int(900), Value::Int(3)]),
        )
        .with_string(900, "Custom A")
        .with_string(901, "Custom B")
}

fn position(order: &[String], table: &str) -> usize {
    order
        .iter()
        .position(|t| t == table)
        .unwrap_or_else(|| panic!("{table} not in load order"))
}

/// Wraps the default analyzer and counts validation passes.
struct CountingAnalyzer {
    inner: ColumnNameAnalyzer,
    validations: Arc<AtomicUsize>,
}

impl RelationshipAnalyzer for CountingAnalyzer {
    fn detect(&mut self, profiles: &[TableProfile]) -> Result<(), AnalyzerError> {
        self.inner.detect(profiles)
    }

    fn load_order(&self) -> Result<Vec<String>, AnalyzerError> {
        self.inner.load_order()
    }

    fn validate(&self) -> ValidationReport {
        self.validations.fetch_add(1, Ordering::SeqCst);
        self.inner.validate()
    }
}

struct FailingAnalyzer;

impl RelationshipAnalyzer for FailingAnalyzer {
    fn detect(&mut self, _: &[TableProfile]) -> Result<(), AnalyzerError> {
        Err(AnalyzerError::Failed("analysis backend offline".to_string()))
    }

    fn load_order(&self) -> Result<Vec<String>, AnalyzerError> {
        Err(AnalyzerError::NotDetected)
    }

    fn validate(&self) -> ValidationReport {
        ValidationReport::default()
    }
}

// ===========================================================================
// Custom content
// ===========================================================================

#[test]
fn override_only_table_loads_after_its_references() {
    let mut pipeline =
        LoadPipeline::new(LoaderConfig::default(), Arc::new(provider_with_custom_content()), context());
    let summary = pipeline.run().unwrap();
    assert_eq!(summary.tables_loaded, 5);
    assert_eq!(summary.rows_skipped, 0);

    let order = pipeline.load_order().to_vec();
    assert!(position(&order, "classes") < position(&order, "mycontent_x"));

    let ctx = pipeline.context();
    let table = ctx.get_table("mycontent_x").unwrap();
    assert_eq!(table.layer(), SourceLayer::Override);
    assert!(!table.is_known_schema());
    assert_eq!(table.len(), 3);
    assert_eq!(
        ctx.get_by_id("mycontent_x", 1)
            .unwrap()
            .get("name")
            .and_then(|f| f.as_str()),
        Some("Custom B")
    );

    let report = ctx.validation_report().unwrap();
    assert_eq!(report.broken_in("mycontent_x").count(), 0);
    assert_eq!(report.total_relationships, 3);
    assert!(report.is_clean());
}

#[test]
fn unrelated_override_table_orders_after_base_tables() {
    let provider = base_provider()
        .with_override(labelled_table("mycontent_x", 5, 100, 4));
    let mut pipeline = LoadPipeline::new(LoaderConfig::default(), Arc::new(provider), context());
    pipeline.run().unwrap();

    let order = pipeline.load_order().to_vec();
    assert_eq!(order.last().map(String::as_str), Some("mycontent_x"));
    for base in ["classes", "racialtypes", "racialsubtypes", "feat"] {
        assert!(position(&order, base) < position(&order, "mycontent_x"));
    }

    let ctx = pipeline.context();
    assert_eq!(ctx.get_table("mycontent_x").unwrap().len(), 5);
    let report = ctx.validation_report().unwrap();
    assert_eq!(report.broken_in("mycontent_x").count(), 0);
    assert_eq!(report.dependency_order.last().map(String::as_str), Some("mycontent_x"));
}

#[test]
fn broken_reference_is_reported_not_fatal() {
    let provider = provider_with_custom_content().with_override(
        MemoryTable::new("mycontent_y", &["Label", "ClassID"])
            .with_row(vec![Value::from("ok"), Value::Int(1)])
            .with_row(vec![Value::from("dangling"), Value::Int(99)]),
    );
    let mut pipeline = LoadPipeline::new(LoaderConfig::default(), Arc::new(provider), context());
    pipeline.run().unwrap();

    let ctx = pipeline.context();
    assert_eq!(ctx.get_table("mycontent_y").unwrap().len(), 2);

    let report = ctx.validation_report().unwrap();
    let broken: Vec<_> = report.broken_in("mycontent_y").collect();
    assert_eq!(broken.len(), 1);
    assert_eq!(broken[0].row, 1);
    assert_eq!(broken[0].target_table, "classes");
    assert_eq!(report.valid_relationships, report.total_relationships - 1);
}

#[test]
fn discovery_is_repeatable() {
    let mut pipeline =
        LoadPipeline::new(LoaderConfig::default(), Arc::new(provider_with_custom_content()), context());
    let first = pipeline.discover();
    let second = pipeline.discover();
    assert_eq!(first, second);
    assert_eq!(first.last().map(|d| d.name.as_str()), Some("mycontent_x"));
}

// ===========================================================================
// String resolution
// ===========================================================================

#[test]
fn one_batch_call_for_all_string_ids_of_a_table() {
    let mut provider = MemoryProvider::new().with_base(labelled_table("mycontent_big", 1000, 5000, 300));
    for id in 5000..5300 {
        provider.insert_string(id, &format!("text {id}"));
    }
    let provider = Arc::new(provider);
    let config = LoaderConfig {
        always_load: Vec::new(),
        ..LoaderConfig::default()
    };

    let mut pipeline = LoadPipeline::new(config, provider.clone(), context());
    let summary = pipeline.run().unwrap();

    assert_eq!(provider.batch_calls(), 1);
    assert_eq!(provider.batch_sizes(), vec![300]);
    assert_eq!(provider.single_calls(), 0);
    assert_eq!(summary.rows_loaded, 1000);
    assert_eq!(summary.strings_resolved, 300);
}

#[test]
fn ids_missing_from_batch_fall_back_to_single_lookups() {
    let mut provider = MemoryProvider::new().with_base(labelled_table("mycontent_big", 100, 5000, 20));
    for id in 5000..5015 {
        provider.insert_string(id, &format!("text {id}"));
    }
    let provider = Arc::new(provider);
    let config = LoaderConfig {
        always_load: Vec::new(),
        ..LoaderConfig::default()
    };

    let mut pipeline = LoadPipeline::new(config, provider.clone(), context());
    pipeline.run().unwrap();

    assert_eq!(provider.batch_calls(), 1);
    assert_eq!(provider.single_calls(), 5);

    // Unresolved references keep their id and load without text.
    let table = pipeline.context().get_table("mycontent_big").unwrap();
    let unresolved = table.get_by_id(19).unwrap().get("Name").unwrap();
    assert_eq!(unresolved.as_int(), Some(5019));
    assert_eq!(unresolved.as_str(), None);
}

// ===========================================================================
// Finalize
// ===========================================================================

#[test]
fn second_finalize_reuses_report() {
    let validations = Arc::new(AtomicUsize::new(0));
    let analyzer = CountingAnalyzer {
        inner: ColumnNameAnalyzer::new(),
        validations: Arc::clone(&validations),
    };
    let mut pipeline =
        LoadPipeline::new(LoaderConfig::default(), Arc::new(provider_with_custom_content()), context())
            .with_analyzer(Box::new(analyzer));

    let summary = pipeline.run().unwrap();
    assert!(!summary.report_from_snapshot);
    assert_eq!(validations.load(Ordering::SeqCst), 1);
    let first = pipeline.context().validation_report().unwrap();

    let second = pipeline.finalize();
    assert_eq!(validations.load(Ordering::SeqCst), 1);
    assert_eq!(second, first);
    assert!(pipeline.summary().report_from_snapshot);
}

#[test]
fn structural_change_revalidates() {
    let validations = Arc::new(AtomicUsize::new(0));
    let analyzer = CountingAnalyzer {
        inner: ColumnNameAnalyzer::new(),
        validations: Arc::clone(&validations),
    };
    let mut pipeline =
        LoadPipeline::new(LoaderConfig::default(), Arc::new(base_provider()), context())
            .with_analyzer(Box::new(analyzer));
    pipeline.run().unwrap();

    pipeline
        .context()
        .store()
        .publish(instance("mycontent_extra", &["Label"], 2));
    pipeline.finalize();
    assert_eq!(validations.load(Ordering::SeqCst), 2);
    assert!(!pipeline.summary().report_from_snapshot);
}

// ===========================================================================
// Failures
// ===========================================================================

#[test]
fn structural_failure_is_reported_after_the_rest_loads() {
    let provider = base_provider().with_override(
        MemoryTable::new("mycontent_bad", &["Label", "Name"])
            .with_malformed_row("unterminated quote")
            .with_malformed_row("unterminated quote"),
    );
    let mut pipeline = LoadPipeline::new(LoaderConfig::default(), Arc::new(provider), context());

    let err = pipeline.run().unwrap_err();
    match &err {
        LoadError::Structural { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].table, "mycontent_bad");
        }
        other => panic!("expected structural failure, got {other}"),
    }
    assert!(err.to_string().contains("mycontent_bad"));

    let ctx = pipeline.context();
    assert!(ctx.is_ready());
    assert!(ctx.get_table("mycontent_bad").is_none());
    assert_eq!(ctx.get_table("classes").unwrap().len(), 4);
    assert_eq!(ctx.table_names().len(), 4);
}

#[test]
fn references_into_a_failed_table_are_reported_missing() {
    let provider = base_provider().with_override(
        MemoryTable::new("classes", &["Label", "Name"])
            .with_malformed_row("unterminated quote")
            .with_malformed_row("unterminated quote"),
    );
    let mut pipeline = LoadPipeline::new(LoaderConfig::default(), Arc::new(provider), context());

    match pipeline.run().unwrap_err() {
        LoadError::Structural { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].table, "classes");
        }
        other => panic!("expected structural failure, got {other}"),
    }

    let ctx = pipeline.context();
    assert!(ctx.get_table("classes").is_none());
    assert_eq!(ctx.get_table("racialsubtypes").unwrap().len(), 2);

    let report = ctx.validation_report().unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.missing_tables, vec!["classes".to_string()]);
    assert_eq!(report.total_relationships, 2);
    assert_eq!(report.valid_relationships, 1);
    assert!(report.dependency_order.contains(&"classes".to_string()));
}

#[test]
fn failed_analysis_uses_priority_then_row_count() {
    let mut pipeline =
        LoadPipeline::new(LoaderConfig::default(), Arc::new(base_provider()), context())
            .with_analyzer(Box::new(FailingAnalyzer));
    let summary = pipeline.run().unwrap();
    assert_eq!(summary.tables_loaded, 4);

    assert_eq!(
        pipeline.load_order(),
        ["classes", "racialtypes", "feat", "racialsubtypes"]
    );
    let report = pipeline.context().validation_report().unwrap();
    assert_eq!(report.total_relationships, 0);
    assert_eq!(report.dependency_order, pipeline.load_order());
}

// ===========================================================================
// Background loading
// ===========================================================================

#[test]
fn background_load_reports_progress_to_completion() {
    let updates: Arc<Mutex<Vec<LoadingProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    let pipeline =
        LoadPipeline::new(LoaderConfig::default(), Arc::new(provider_with_custom_content()), context())
            .with_progress(move |p| sink.lock().push(p.clone()));
    let ctx = Arc::clone(pipeline.context());
    assert!(!ctx.is_ready());

    let handle = pipeline.spawn().unwrap();
    assert_eq!(handle.thread().name(), Some("gamedata-loader"));
    let summary = handle.join().unwrap().unwrap();
    assert_eq!(summary.tables_loaded, 5);
    assert!(ctx.is_ready());
    assert!(ctx.guard().is_warm());

    let updates = updates.lock();
    assert!(updates.windows(2).all(|w| w[0].percent <= w[1].percent));
    let stages: Vec<LoadStage> = updates.iter().map(|p| p.stage).collect();
    for stage in [
        LoadStage::Discovery,
        LoadStage::Ordering,
        LoadStage::Synthesis,
        LoadStage::Population,
        LoadStage::Finalize,
        LoadStage::Complete,
    ] {
        assert!(stages.contains(&stage), "no progress for {stage}");
    }
    let last = updates.last().unwrap();
    assert_eq!((last.stage, last.percent), (LoadStage::Complete, 100));
}

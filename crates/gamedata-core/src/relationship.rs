//! Cross-table relationship detection, load ordering and validation.
//!
//! The [`RelationshipAnalyzer`] contract is run twice per load: once over
//! table *structure* (column names only) to compute a load order, and once
//! over populated data to validate the actual reference values.
//! [`ColumnNameAnalyzer`] is the default implementation.

use crate::graph::{DependencyGraph, LoadOrder};
use crate::table::{TableInstance, table_key};
use crate::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

// ===========================================================================
// Errors
// ===========================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalyzerError {
    #[error("load order requested before relationships were detected")]
    NotDetected,

    #[error("relationship hint {table}.{column} -> {target}: {reason}")]
    InvalidHint {
        table: String,
        column: String,
        target: String,
        reason: String,
    },

    #[error("relationship analysis failed: {0}")]
    Failed(String),
}

// ===========================================================================
// Edges and report
// ===========================================================================

/// How a reference column's values point at the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    /// Values are declared ids of rows in the target table.
    RowIndex,
    /// Values are the names of other tables.
    TableName,
}

/// A detected cross-table reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub source: String,
    pub target: String,
    pub column: String,
    pub kind: ReferenceKind,
}

/// A reference value that does not resolve in its target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenReference {
    pub source_table: String,
    pub column: String,
    pub row: usize,
    pub value: String,
    pub target_table: String,
}

/// Outcome of relationship validation over populated data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total_relationships: usize,
    pub valid_relationships: usize,
    pub broken_references: Vec<BrokenReference>,
    pub missing_tables: Vec<String>,
    pub dependency_order: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.broken_references.is_empty() && self.missing_tables.is_empty()
    }

    /// Broken references originating in `table`.
    pub fn broken_in<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a BrokenReference> {
        let key = table_key(table);
        self.broken_references
            .iter()
            .filter(move |b| b.source_table == key)
    }
}

/// An explicit reference supplied by configuration, added to detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipHint {
    pub table: String,
    pub column: String,
    pub target: String,
}

// ===========================================================================
// Analyzer contract
// ===========================================================================

/// What the analyzer sees of one table. `data` is `None` during the
/// structural pass and set once the table is populated.
#[derive(Debug, Clone)]
pub struct TableProfile {
    pub name: String,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub data: Option<Arc<TableInstance>>,
}

impl TableProfile {
    pub fn structural(name: &str, columns: Vec<String>, row_count: usize) -> Self {
        Self {
            name: table_key(name),
            columns,
            row_count,
            data: None,
        }
    }

    pub fn populated(instance: Arc<TableInstance>) -> Self {
        Self {
            name: instance.name().to_string(),
            columns: instance
                .schema()
                .columns()
                .iter()
                .map(|c| c.name.clone())
                .collect(),
            row_count: instance.len(),
            data: Some(instance),
        }
    }
}

/// Detects references between tables, orders tables and validates values.
pub trait RelationshipAnalyzer: Send {
    /// Replace any previous detection with one over `profiles`. Profile
    /// order is the encounter order used to break ordering ties.
    fn detect(&mut self, profiles: &[TableProfile]) -> Result<(), AnalyzerError>;

    /// Tables ordered so that referenced tables come first.
    fn load_order(&self) -> Result<Vec<String>, AnalyzerError>;

    /// Validate the most recent detection.
    fn validate(&self) -> ValidationReport;
}

// ===========================================================================
// Default analyzer
// ===========================================================================

/// Column-name suffixes stripped when matching a column to a table.
const REFERENCE_SUFFIXES: &[&str] = &["_id", "id", "_ref", "ref", "_index", "index"];

/// Suffix marking a column whose values name other tables.
const TABLE_NAME_SUFFIX: &str = "table";

/// Matches reference columns by name against the set of table names, and
/// validates reference values when data is present.
#[derive(Debug, Default)]
pub struct ColumnNameAnalyzer {
    hints: Vec<RelationshipHint>,
    edges: Vec<DependencyEdge>,
    order: Option<LoadOrder>,
    broken: Vec<BrokenReference>,
    missing: BTreeSet<String>,
    invalid_edges: HashSet<usize>,
}

impl ColumnNameAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hints(hints: Vec<RelationshipHint>) -> Self {
        Self {
            hints,
            ..Self::default()
        }
    }

    /// Edges from the most recent detection.
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Cycle groups from the most recent detection.
    pub fn cycles(&self) -> &[Vec<String>] {
        self.order
            .as_ref()
            .map(|o| o.cycles.as_slice())
            .unwrap_or(&[])
    }

    fn push_edge(&mut self, edge: DependencyEdge) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    fn apply_hints(
        &mut self,
        by_name: &HashMap<&str, &TableProfile>,
    ) -> Result<(), AnalyzerError> {
        let hints = self.hints.clone();
        for hint in hints {
            let table = table_key(&hint.table);
            let target = table_key(&hint.target);
            let Some(profile) = by_name.get(table.as_str()) else {
                continue;
            };
            let Some(column) = profile
                .columns
                .iter()
                .find(|c| c.eq_ignore_ascii_case(&hint.column))
            else {
                return Err(AnalyzerError::InvalidHint {
                    table,
                    column: hint.column.clone(),
                    target,
                    reason: "column not present".to_string(),
                });
            };
            self.push_edge(DependencyEdge {
                source: table.clone(),
                target,
                column: column.clone(),
                kind: ReferenceKind::RowIndex,
            });
        }
        Ok(())
    }

    fn check_row_references(
        &mut self,
        edge_idx: usize,
        source: &TableInstance,
        target: Option<&TableProfile>,
    ) {
        let edge = self.edges[edge_idx].clone();
        let Some(target_data) = target.and_then(|t| t.data.as_ref()) else {
            self.missing.insert(edge.target.clone());
            self.invalid_edges.insert(edge_idx);
            return;
        };

        for record in source.records() {
            let Some(value) = record.get(&edge.column).and_then(reference_id) else {
                continue;
            };
            if value < 0 {
                continue;
            }
            if !target_data.contains_id(value) {
                self.broken.push(BrokenReference {
                    source_table: edge.source.clone(),
                    column: edge.column.clone(),
                    row: record.row(),
                    value: value.to_string(),
                    target_table: edge.target.clone(),
                });
                self.invalid_edges.insert(edge_idx);
            }
        }
    }

    fn detect_table_name_columns(
        &mut self,
        instance: &TableInstance,
        by_name: &HashMap<&str, &TableProfile>,
    ) {
        for column in instance.schema().columns() {
            let normalized = normalize(&column.name);
            if !normalized.ends_with(TABLE_NAME_SUFFIX) {
                continue;
            }
            let mut targets = BTreeSet::new();
            for record in instance.records() {
                if let Some(name) = record.get(&column.name).and_then(FieldValue::as_str) {
                    let name = table_key(name);
                    if !name.is_empty() {
                        targets.insert((name, record.row()));
                    }
                }
            }
            let mut emitted: HashSet<String> = HashSet::new();
            for (target, row) in targets {
                if let Some(profile) = by_name.get(target.as_str()) {
                    if emitted.insert(target.clone()) {
                        let edge = DependencyEdge {
                            source: instance.name().to_string(),
                            target: target.clone(),
                            column: column.name.clone(),
                            kind: ReferenceKind::TableName,
                        };
                        self.push_edge(edge.clone());
                        if profile.data.is_none()
                            && let Some(idx) = self.edges.iter().position(|e| *e == edge)
                        {
                            self.missing.insert(target);
                            self.invalid_edges.insert(idx);
                        }
                    }
                } else {
                    self.broken.push(BrokenReference {
                        source_table: instance.name().to_string(),
                        column: column.name.clone(),
                        row,
                        value: target.clone(),
                        target_table: target.clone(),
                    });
                    self.missing.insert(target);
                }
            }
        }
    }
}

impl RelationshipAnalyzer for ColumnNameAnalyzer {
    fn detect(&mut self, profiles: &[TableProfile]) -> Result<(), AnalyzerError> {
        self.edges.clear();
        self.broken.clear();
        self.missing.clear();
        self.invalid_edges.clear();
        self.order = None;

        let by_name: HashMap<&str, &TableProfile> =
            profiles.iter().map(|p| (p.name.as_str(), p)).collect();
        let known: HashSet<&str> = by_name.keys().copied().collect();

        // Structural edges from column names.
        for profile in profiles {
            for column in &profile.columns {
                if let Some(target) = reference_target(column, &known)
                    && target != profile.name
                {
                    self.push_edge(DependencyEdge {
                        source: profile.name.clone(),
                        target,
                        column: column.clone(),
                        kind: ReferenceKind::RowIndex,
                    });
                }
            }
        }
        self.apply_hints(&by_name)?;

        // Once data is present, references out of tables that never got
        // data cannot be checked. References into them are still reported.
        let data_pass = profiles.iter().any(|p| p.data.is_some());
        if data_pass {
            self.edges
                .retain(|e| by_name.get(e.source.as_str()).is_some_and(|p| p.data.is_some()));
        }

        // Value checks when data is present.
        let row_edges: Vec<usize> = (0..self.edges.len()).collect();
        for idx in row_edges {
            let source = self.edges[idx].source.clone();
            let target = self.edges[idx].target.clone();
            if let Some(data) = by_name.get(source.as_str()).and_then(|p| p.data.clone()) {
                self.check_row_references(idx, &data, by_name.get(target.as_str()).copied());
            }
        }
        for profile in profiles {
            if let Some(data) = &profile.data {
                self.detect_table_name_columns(data, &by_name);
            }
        }

        let mut graph = DependencyGraph::new();
        for profile in profiles {
            graph.add_table(&profile.name);
        }
        for edge in &self.edges {
            if known.contains(edge.target.as_str()) {
                graph.add_dependency(&edge.source, &edge.target);
            }
        }
        self.order = Some(graph.load_order().clone());
        Ok(())
    }

    fn load_order(&self) -> Result<Vec<String>, AnalyzerError> {
        self.order
            .as_ref()
            .map(|o| o.order.clone())
            .ok_or(AnalyzerError::NotDetected)
    }

    fn validate(&self) -> ValidationReport {
        ValidationReport {
            total_relationships: self.edges.len(),
            valid_relationships: self.edges.len() - self.invalid_edges.len(),
            broken_references: self.broken.clone(),
            missing_tables: self.missing.iter().cloned().collect(),
            dependency_order: self
                .order
                .as_ref()
                .map(|o| o.order.clone())
                .unwrap_or_default(),
        }
    }
}

fn normalize(column: &str) -> String {
    column.trim().to_ascii_lowercase()
}

/// Table referenced by a column name, if any.
fn reference_target(column: &str, tables: &HashSet<&str>) -> Option<String> {
    let column = normalize(column);
    REFERENCE_SUFFIXES
        .iter()
        .filter_map(|suffix| column.strip_suffix(suffix))
        .map(|stem| stem.trim_end_matches('_'))
        .filter(|stem| !stem.is_empty())
        .find_map(|stem| {
            [stem.to_string(), format!("{stem}s"), format!("{stem}es")]
                .into_iter()
                .find(|candidate| tables.contains(candidate.as_str()))
        })
}

fn reference_id(field: &FieldValue) -> Option<i64> {
    match field {
        FieldValue::Int(i) => Some(*i),
        FieldValue::Text(t) => t.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{instance, int_instance, text_instance};

    fn structural(name: &str, columns: &[&str]) -> TableProfile {
        TableProfile::structural(name, columns.iter().map(|c| c.to_string()).collect(), 1)
    }

    #[test]
    fn reference_target_strips_suffixes_and_pluralizes() {
        let tables: HashSet<&str> = ["classes", "feat", "racialtypes"].into_iter().collect();
        assert_eq!(reference_target("ClassID", &tables).as_deref(), Some("classes"));
        assert_eq!(reference_target("feat_id", &tables).as_deref(), Some("feat"));
        assert_eq!(reference_target("Feat", &tables), None);
        assert_eq!(reference_target("Label", &tables), None);
        assert_eq!(reference_target("id", &tables), None);
    }

    #[test]
    fn structural_pass_orders_dependencies_first() {
        let mut analyzer = ColumnNameAnalyzer::new();
        analyzer
            .detect(&[
                structural("racialsubtypes", &["Label", "ClassID", "RacialTypeID"]),
                structural("classes", &["Label"]),
                structural("racialtypes", &["Label"]),
                structural("mycontent_x", &["Label", "Value"]),
            ])
            .unwrap();

        let order = analyzer.load_order().unwrap();
        assert_eq!(order, vec!["classes", "racialtypes", "racialsubtypes", "mycontent_x"]);
        assert_eq!(analyzer.edges().len(), 2);
        assert!(analyzer.cycles().is_empty());
    }

    #[test]
    fn load_order_before_detect_is_an_error() {
        assert_eq!(
            ColumnNameAnalyzer::new().load_order(),
            Err(AnalyzerError::NotDetected)
        );
    }

    #[test]
    fn hints_add_edges() {
        let mut analyzer = ColumnNameAnalyzer::with_hints(vec![RelationshipHint {
            table: "classes".to_string(),
            column: "AttackBonusTable".to_string(),
            target: "cls_atk".to_string(),
        }]);
        analyzer
            .detect(&[
                structural("classes", &["Label", "AttackBonusTable"]),
                structural("cls_atk", &["BAB"]),
            ])
            .unwrap();
        assert_eq!(analyzer.load_order().unwrap(), vec!["cls_atk", "classes"]);
    }

    #[test]
    fn hint_with_unknown_column_fails() {
        let mut analyzer = ColumnNameAnalyzer::with_hints(vec![RelationshipHint {
            table: "classes".to_string(),
            column: "Nope".to_string(),
            target: "feat".to_string(),
        }]);
        let err = analyzer
            .detect(&[structural("classes", &["Label"]), structural("feat", &["Label"])])
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidHint { .. }));
    }

    #[test]
    fn data_pass_reports_broken_row_references() {
        let classes = instance("classes", &["Label"], 3);
        let subtypes = int_instance("racialsubtypes", "ClassID", &[0, 2, 7]);

        let mut analyzer = ColumnNameAnalyzer::new();
        analyzer
            .detect(&[
                TableProfile::populated(Arc::new(classes)),
                TableProfile::populated(Arc::new(subtypes)),
            ])
            .unwrap();
        let report = analyzer.validate();

        assert_eq!(report.total_relationships, 1);
        assert_eq!(report.valid_relationships, 0);
        assert_eq!(report.broken_references.len(), 1);
        let broken = &report.broken_references[0];
        assert_eq!(broken.row, 2);
        assert_eq!(broken.value, "7");
        assert_eq!(broken.target_table, "classes");
        assert_eq!(report.broken_in("RacialSubtypes").count(), 1);
    }

    #[test]
    fn data_pass_detects_table_name_columns() {
        let classes = text_instance(
            "classes",
            "FeatsTable",
            &["cls_feat_barb", "cls_feat_wiz", "****"],
        );
        let barb = instance("cls_feat_barb", &["FeatIndex"], 2);

        let mut analyzer = ColumnNameAnalyzer::new();
        analyzer
            .detect(&[
                TableProfile::populated(Arc::new(classes)),
                TableProfile::populated(Arc::new(barb)),
            ])
            .unwrap();
        let report = analyzer.validate();

        assert_eq!(report.missing_tables, vec!["cls_feat_wiz".to_string()]);
        assert_eq!(report.broken_references.len(), 1);
        assert_eq!(report.total_relationships, 1);
        assert_eq!(report.valid_relationships, 1);
        assert_eq!(report.dependency_order, vec!["cls_feat_barb", "classes"]);
    }

    #[test]
    fn references_into_tables_without_data_are_missing() {
        let subtypes = int_instance("racialsubtypes", "ClassID", &[0, 1]);
        let spells = text_instance("spells", "FeatsTable", &["cls_feat_barb"]);

        let mut analyzer = ColumnNameAnalyzer::new();
        analyzer
            .detect(&[
                structural("classes", &["Label", "Name"]),
                structural("cls_feat_barb", &["FeatIndex"]),
                structural("mycontent_x", &["Label", "ClassID"]),
                TableProfile::populated(Arc::new(subtypes)),
                TableProfile::populated(Arc::new(spells)),
            ])
            .unwrap();
        let report = analyzer.validate();

        assert_eq!(
            report.missing_tables,
            vec!["classes".to_string(), "cls_feat_barb".to_string()]
        );
        // mycontent_x -> classes is dropped: its source has no data.
        assert_eq!(report.total_relationships, 2);
        assert_eq!(report.valid_relationships, 0);
        assert!(report.broken_references.is_empty());
        assert!(!report.is_clean());
    }

    #[test]
    fn unrelated_table_is_clean() {
        let mut analyzer = ColumnNameAnalyzer::new();
        analyzer
            .detect(&[TableProfile::populated(Arc::new(instance(
                "mycontent_x",
                &["Label", "Value"],
                4,
            )))])
            .unwrap();
        let report = analyzer.validate();
        assert!(report.is_clean());
        assert_eq!(report.total_relationships, 0);
    }
}

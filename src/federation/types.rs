// SPDX-License-Identifier: BUSL-1.1

//! Types shared by the federation stages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::query::{Expr, JoinKind};

/// One real source collection named in a FROM list.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionDescriptor {
    /// Collection name on the backend
    pub name: String,
    /// Name the query refers to it by
    pub alias: String,
    pub join_kind: Option<JoinKind>,
    pub join_condition: Option<Expr>,
}

/// True when rows of `collections[index]` may be null-extended by the joins
/// of the FROM list: its own LEFT or FULL join, or any later RIGHT or FULL
/// join, since that preserves the right side against everything before it.
pub fn is_nullable_side(collections: &[CollectionDescriptor], index: usize) -> bool {
    let own = collections
        .get(index)
        .is_some_and(|c| matches!(c.join_kind, Some(JoinKind::Left) | Some(JoinKind::Full)));
    own || collections
        .iter()
        .skip(index + 1)
        .any(|c| matches!(c.join_kind, Some(JoinKind::Right) | Some(JoinKind::Full)))
}

/// Outcome of predicate classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationResult {
    /// Pushable predicate per table alias, already AND-chained
    pub supported_by_table: BTreeMap<String, Expr>,
    /// Conjuncts evaluated by the relational engine, in source order
    pub residual: Vec<Expr>,
}

impl ClassificationResult {
    /// The pushable predicate for `alias`; `true` when nothing was pushed.
    pub fn predicate_for(&self, alias: &str) -> Expr {
        self.supported_by_table
            .get(alias)
            .cloned()
            .unwrap_or_else(|| Expr::boolean(true))
    }

    /// Number of pushed conjuncts across all tables, `true` placeholders excluded.
    pub fn pushed_count(&self) -> usize {
        self.supported_by_table
            .values()
            .flat_map(|e| e.conjuncts())
            .filter(|e| !e.is_true_literal())
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpatialFlavor {
    Gml,
    Kml,
}

impl SpatialFlavor {
    pub fn prefix(&self) -> &'static str {
        match self {
            SpatialFlavor::Gml => "gml",
            SpatialFlavor::Kml => "kml",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "gml" => Some(SpatialFlavor::Gml),
            "kml" => Some(SpatialFlavor::Kml),
            _ => None,
        }
    }

    /// Local names of the geometry elements of this flavor.
    pub fn spatial_types(&self) -> &'static [&'static str] {
        match self {
            SpatialFlavor::Gml => &[
                "MultiPoint",
                "Point",
                "LineString",
                "LinearRing",
                "Polygon",
                "MultiLineString",
                "MultiPolygon",
                "MultiGeometry",
            ],
            SpatialFlavor::Kml => &["Point", "LineString", "Polygon", "MultiGeometry"],
        }
    }
}

/// Spatial namespace discovered by the pre-fetch probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialNamespace {
    pub flavor: SpatialFlavor,
    pub uri: String,
}

/// Backend-variant metadata a query is compiled against.
///
/// Produced by the probe and passed explicitly to every compiler call; drivers
/// never keep it between queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendVariant {
    pub namespace: Option<SpatialNamespace>,
}

impl BackendVariant {
    pub fn with_namespace(flavor: SpatialFlavor, uri: impl Into<String>) -> Self {
        Self {
            namespace: Some(SpatialNamespace {
                flavor,
                uri: uri.into(),
            }),
        }
    }

    pub fn flavor(&self) -> Option<SpatialFlavor> {
        self.namespace.as_ref().map(|ns| ns.flavor)
    }
}

/// Columns requested from one collection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ColumnSet {
    /// Natural projection, everything the backend holds
    #[default]
    All,
    /// Explicit columns in first-reference order, without duplicates
    Named(Vec<String>),
}

impl ColumnSet {
    pub fn named<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = ColumnSet::Named(Vec::new());
        for column in columns {
            set.insert(column);
        }
        set
    }

    pub fn insert(&mut self, column: impl Into<String>) {
        if let ColumnSet::Named(columns) = self {
            let column = column.into();
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
    }

    pub fn columns(&self) -> &[String] {
        match self {
            ColumnSet::All => &[],
            ColumnSet::Named(columns) => columns,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, ColumnSet::All)
    }
}

/// A projection aggregate executed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    /// Lowercase function name, e.g. `count`
    pub function: String,
    /// Argument column, `None` for `*`
    pub column: Option<String>,
}

impl Aggregate {
    /// Pseudo-column the backend returns this aggregate under.
    pub fn output_name(&self) -> String {
        format!(
            "_func__{}__{}",
            self.function,
            self.column.as_deref().unwrap_or("all")
        )
    }
}

/// Output name of `alias.column` in a combined join fetch.
pub fn joined_column_name(alias: &str, column: &str) -> String {
    format!("{alias}__{column}")
}

/// One collection's share of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionScan {
    pub collection: CollectionDescriptor,
    /// Pushable predicate, `true` when nothing is pushed
    pub predicate: Expr,
    pub columns: ColumnSet,
}

/// Everything a driver needs to run one native query.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    /// One scan, or two for a backend-side join
    pub scans: Vec<CollectionScan>,
    /// Backend-side grouping columns (single-scan requests only)
    pub group_by: Vec<String>,
    pub aggregates: Vec<Aggregate>,
    pub variant: BackendVariant,
}

impl FetchRequest {
    pub fn single(scan: CollectionScan, variant: BackendVariant) -> Self {
        Self {
            scans: vec![scan],
            group_by: Vec::new(),
            aggregates: Vec::new(),
            variant,
        }
    }

    pub fn is_join(&self) -> bool {
        self.scans.len() > 1
    }

    /// Collection names joined by `__`, the label used in errors and stats.
    pub fn label(&self) -> String {
        self.scans
            .iter()
            .map(|s| s.collection.name.as_str())
            .collect::<Vec<_>>()
            .join("__")
    }
}

/// Raw backend output, before standardization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    /// JSON documents (document-filter family)
    Documents(Vec<serde_json::Value>),
    /// Serialized `<result>` elements (XQuery family)
    Markup(Vec<String>),
}

impl RawResult {
    pub fn len(&self) -> usize {
        match self {
            RawResult::Documents(docs) => docs.len(),
            RawResult::Markup(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The common row shape every backend is normalized to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardRow {
    /// Serialized spatial payload, in the driver's geometry encoding
    pub geometry: Option<String>,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// How a driver serializes geometries in `StandardRow::geometry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryEncoding {
    GeoJson,
    Gml,
    Kml,
    Wkt,
}

/// Standardized rows for one FROM entry (or one combined join).
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    /// Collection name, `a__b` for a combined join
    pub table: String,
    /// Alias the rows replace, `a__b` for a combined join
    pub alias: String,
    /// Aliases of the FROM entries these rows stand for
    pub sources: Vec<String>,
    pub rows: Vec<StandardRow>,
    /// Columns the query references, used to shape an empty result
    pub columns: Vec<String>,
    pub encoding: GeometryEncoding,
    /// Property columns holding serialized geometries (combined joins)
    pub geometry_columns: Vec<String>,
}

impl FetchResult {
    pub fn is_combined(&self) -> bool {
        self.sources.len() > 1
    }
}

/// Primitive kind of a rebuilt column, sampled from the first row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Number,
    String,
    Bool,
    Null,
}

impl ColumnKind {
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(_) => ColumnKind::Number,
            serde_json::Value::String(_) => ColumnKind::String,
            serde_json::Value::Bool(_) => ColumnKind::Bool,
            serde_json::Value::Null => ColumnKind::Null,
            // Nested values are re-embedded as their JSON text.
            _ => ColumnKind::String,
        }
    }
}

pub type ColumnTypeMap = BTreeMap<String, ColumnKind>;

/// Result metadata for one source fetch.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFetchResult {
    /// Alias the rows were fetched for
    pub alias: String,
    /// Collection name
    pub collection: String,
    /// Number of rows fetched
    pub row_count: u64,
    /// Fetch duration in milliseconds
    pub fetch_time_ms: f64,
}

/// Per-query statistics, returned alongside the rows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FederationMetadata {
    /// Per-source fetch results
    pub source_results: Vec<SourceFetchResult>,
    /// Rows fetched across all sources
    pub total_rows: u64,
    /// Fields present in the first fetched row, per alias
    pub fields_per_table: BTreeMap<String, Vec<String>>,
    pub pushed_predicates: usize,
    pub residual_predicates: usize,
    pub probe_time_ms: f64,
    /// Relational engine time in milliseconds
    pub engine_time_ms: f64,
    /// Total pipeline time in milliseconds
    pub total_time_ms: f64,
    pub sub_selects_resolved: usize,
    pub warnings: Vec<String>,
}

impl FederationMetadata {
    /// Folds a nested level's statistics into this one. Timings of the
    /// nested level are already contained in the caller's wall clock.
    pub fn merge(&mut self, nested: FederationMetadata) {
        self.source_results.extend(nested.source_results);
        self.total_rows += nested.total_rows;
        for (alias, fields) in nested.fields_per_table {
            self.fields_per_table.entry(alias).or_insert(fields);
        }
        self.pushed_predicates += nested.pushed_predicates;
        self.residual_predicates += nested.residual_predicates;
        self.probe_time_ms += nested.probe_time_ms;
        self.engine_time_ms += nested.engine_time_ms;
        self.sub_selects_resolved += nested.sub_selects_resolved;
        self.warnings.extend(nested.warnings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::BinaryOp;

    #[test]
    fn aggregate_output_names() {
        let star = Aggregate {
            function: "count".into(),
            column: None,
        };
        assert_eq!(star.output_name(), "_func__count__all");
        let col = Aggregate {
            function: "count".into(),
            column: Some("name".into()),
        };
        assert_eq!(col.output_name(), "_func__count__name");
    }

    #[test]
    fn column_set_deduplicates_in_order() {
        let set = ColumnSet::named(["b", "a", "b"]);
        assert_eq!(set.columns(), ["b".to_string(), "a".to_string()]);
        let mut all = ColumnSet::All;
        all.insert("x");
        assert!(all.is_all());
    }

    #[test]
    fn predicate_for_missing_table_is_true() {
        let mut result = ClassificationResult::default();
        result.supported_by_table.insert(
            "p".into(),
            Expr::binary(BinaryOp::Eq, Expr::column("p", "a"), Expr::number(1)),
        );
        assert!(result.predicate_for("q").is_true_literal());
        assert_eq!(result.pushed_count(), 1);
    }

    fn joined(alias: &str, join_kind: Option<JoinKind>) -> CollectionDescriptor {
        CollectionDescriptor {
            name: alias.into(),
            alias: alias.into(),
            join_kind,
            join_condition: None,
        }
    }

    #[test]
    fn nullable_side_of_outer_joins() {
        let left = [joined("a", None), joined("b", Some(JoinKind::Left))];
        assert!(!is_nullable_side(&left, 0));
        assert!(is_nullable_side(&left, 1));

        let right = [joined("a", None), joined("b", Some(JoinKind::Right))];
        assert!(is_nullable_side(&right, 0));
        assert!(!is_nullable_side(&right, 1));
    }

    #[test]
    fn every_table_before_a_right_join_is_nullable() {
        let tables = [
            joined("a", None),
            joined("b", Some(JoinKind::Inner)),
            joined("c", Some(JoinKind::Right)),
        ];
        assert!(is_nullable_side(&tables, 0));
        assert!(is_nullable_side(&tables, 1));
        assert!(!is_nullable_side(&tables, 2));

        let full = [joined("a", None), joined("b", Some(JoinKind::Full))];
        assert!(is_nullable_side(&full, 0));
        assert!(is_nullable_side(&full, 1));
    }
}

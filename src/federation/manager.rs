// SPDX-License-Identifier: BUSL-1.1

//! Federation execution manager.
//!
//! Orchestrates the full federation pipeline:
//! parse → normalize → resolve sub-selects → probe → classify → fetch →
//! rebuild → execute in the relational engine → optional GeoJSON.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};
use tracing::instrument;

use crate::config::{FederationConfig, RelationalKind};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::registry::DriverRegistry;
use crate::engine::traits::{BackendDriver, RelationalEngine};
use crate::engine::types::{QueryResult, Value};
use crate::federation::capability::{CapabilityDescriptor, GEOMETRY_COLUMN};
use crate::federation::classifier::classify;
use crate::federation::duckdb_engine::DuckDbEngine;
use crate::federation::geojson::to_feature_collection;
use crate::federation::normalizer::normalize;
use crate::federation::postgis_engine::PostgisEngine;
use crate::federation::rebuilder::{as_aggregate, rebuild, RebuildContext};
use crate::federation::retrieval::{self, RetrievalPlan};
use crate::federation::types::{
    Aggregate, ClassificationResult, CollectionDescriptor, CollectionScan, ColumnSet,
    FederationMetadata, GeometryEncoding,
};
use crate::query::{
    parse_select, render_select, BinaryOp, ColumnRef, Expr, Select, TableSource, UnaryOp,
};

/// Rows, optional GeoJSON and statistics of one federated query.
#[derive(Debug, Clone)]
pub struct FederatedResult {
    pub result: QueryResult,
    /// `FeatureCollection` built from the `st_asgeojson` column
    pub geojson: Option<serde_json::Value>,
    pub metadata: FederationMetadata,
}

/// A WHERE sub-select after resolution.
enum Resolved {
    /// References the enclosing query; kept in place, rebuilt
    Correlated(Select),
    /// Executed; its rows replace it
    Rows(QueryResult),
}

/// Runs SQL over one backend driver and one relational engine.
pub struct FederatedQuery {
    driver: Arc<dyn BackendDriver>,
    engine: Arc<dyn RelationalEngine>,
    geojson: bool,
}

impl FederatedQuery {
    /// `driver` must already be connected.
    pub fn new(driver: Arc<dyn BackendDriver>, engine: Arc<dyn RelationalEngine>) -> Self {
        Self {
            driver,
            engine,
            geojson: false,
        }
    }

    pub fn with_geojson(mut self, enabled: bool) -> Self {
        self.geojson = enabled;
        self
    }

    /// Builds and connects the configured driver and relational engine.
    pub async fn from_config(config: &FederationConfig) -> EngineResult<Self> {
        let driver = DriverRegistry::with_builtin().create(&config.backend.driver, &config.backend)?;
        driver.connect().await?;

        let engine: Arc<dyn RelationalEngine> = match config.relational.engine {
            RelationalKind::DuckDb => Arc::new(DuckDbEngine::new(config.relational.duckdb_spatial)),
            RelationalKind::Postgis => {
                let url = config.relational.url.as_ref().ok_or_else(|| {
                    EngineError::configuration("the postgis engine needs a connection url")
                })?;
                Arc::new(PostgisEngine::connect_lazy(url.expose())?)
            }
        };
        tracing::info!(
            driver = driver.driver_id(),
            engine = engine.engine_id(),
            "Federation ready"
        );
        Ok(Self::new(driver, engine).with_geojson(config.geojson))
    }

    pub fn driver(&self) -> &dyn BackendDriver {
        self.driver.as_ref()
    }

    /// Executes one SELECT end-to-end.
    #[instrument(skip(self, sql), fields(query_len = sql.len(), driver = self.driver.driver_id()))]
    pub async fn execute(&self, sql: &str) -> EngineResult<FederatedResult> {
        let total_start = Instant::now();
        let mut metadata = FederationMetadata::default();

        let select = parse_select(sql)?;
        let rebuilt = self.resolve(select, &[], &mut metadata).await?;
        let final_sql = render_select(&rebuilt);
        tracing::debug!(sql = %final_sql, "Executing rebuilt query");

        let result = self.run(&final_sql, &mut metadata).await?;
        let geojson = if self.geojson {
            to_feature_collection(&result)
        } else {
            None
        };

        metadata.total_time_ms = total_start.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            rows = result.rows.len(),
            fetched = metadata.total_rows,
            pushed = metadata.pushed_predicates,
            residual = metadata.residual_predicates,
            total_ms = metadata.total_time_ms,
            "Federated query complete"
        );
        Ok(FederatedResult {
            result,
            geojson,
            metadata,
        })
    }

    async fn run(&self, sql: &str, metadata: &mut FederationMetadata) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let result = self.engine.execute(sql).await?;
        metadata.engine_time_ms += start.elapsed().as_secs_f64() * 1000.0;
        Ok(result)
    }

    /// Turns one query level into a rebuilt query over inline tables.
    ///
    /// `outer` lists the aliases of enclosing levels, so correlated
    /// references can be told apart.
    fn resolve<'a>(
        &'a self,
        select: Select,
        outer: &'a [String],
        metadata: &'a mut FederationMetadata,
    ) -> BoxFuture<'a, EngineResult<Select>> {
        async move {
            let mut select = normalize(select);

            // FROM sub-selects cannot see this level, so they resolve on their own.
            let mut from = Vec::with_capacity(select.from.len());
            for mut item in std::mem::take(&mut select.from) {
                if let TableSource::SubSelect(inner) = item.source {
                    let mut nested = FederationMetadata::default();
                    let rebuilt = self.resolve(*inner, &[], &mut nested).await?;
                    metadata.merge(nested);
                    metadata.sub_selects_resolved += 1;
                    item.source = TableSource::SubSelect(Box::new(rebuilt));
                }
                from.push(item);
            }
            select.from = from;

            let scope: Vec<String> = outer
                .iter()
                .cloned()
                .chain(select.aliases().into_iter().map(str::to_string))
                .collect();
            if let Some(selection) = select.selection.take() {
                select.selection = Some(self.resolve_expr(selection, &scope, metadata).await?);
            }

            let collections = collections_of(&select);
            if collections.is_empty() {
                return Ok(select);
            }
            self.federate(select, collections, metadata).await
        }
        .boxed()
    }

    /// Probe, classify, fetch and rebuild for the real collections of a level.
    async fn federate(
        &self,
        select: Select,
        collections: Vec<CollectionDescriptor>,
        metadata: &mut FederationMetadata,
    ) -> EngineResult<Select> {
        let driver = self.driver.as_ref();
        let capability = driver.capabilities();

        let (variant, probe_ms) = retrieval::probe(driver, &collections).await?;
        metadata.probe_time_ms += probe_ms;

        let classification = classify(select.selection.as_ref(), &collections, capability, &variant);
        metadata.pushed_predicates += classification.pushed_count();
        metadata.residual_predicates += classification.residual.len();

        let grouping = pushdown_grouping(&select, &collections, capability, &classification);
        let referenced = referenced_columns(&select, &collections, &classification);
        let scans: Vec<CollectionScan> = collections
            .iter()
            .map(|collection| CollectionScan {
                columns: column_set(&select, &collection.alias, &referenced),
                predicate: classification.predicate_for(&collection.alias),
                collection: collection.clone(),
            })
            .collect();

        // Correlated sub-selects in the residual still name the original
        // aliases, which a combined fetch would replace.
        let combine = !classification.residual.iter().any(Expr::contains_sub_select);
        let (group_by, aggregates) = grouping.clone().unwrap_or_default();
        let retrieved = retrieval::retrieve(
            driver,
            RetrievalPlan {
                scans,
                referenced,
                group_by,
                aggregates,
                variant,
                combine,
            },
        )
        .await?;

        for result in &retrieved.results {
            if let Some(first) = result.rows.first() {
                let mut fields: Vec<String> = first.properties.keys().cloned().collect();
                if first.geometry.is_some() {
                    fields.push(GEOMETRY_COLUMN.to_string());
                }
                metadata.fields_per_table.insert(result.alias.clone(), fields);
            }
        }
        metadata.total_rows += retrieved.total_rows;
        metadata.source_results.extend(retrieved.sources);

        let engine = self.engine.as_ref();
        let parser = |encoding: GeometryEncoding| engine.geometry_parser(encoding);
        let pushed_aggregates = grouping
            .as_ref()
            .map(|(_, aggregates)| (collections[0].alias.as_str(), aggregates.as_slice()));
        let rebuilt = rebuild(
            select,
            RebuildContext {
                results: &retrieved.results,
                residual: classification.residual,
                pushed_aggregates,
                geometry_parser: &parser,
            },
        );
        metadata.warnings.extend(rebuilt.warnings);
        Ok(rebuilt.select)
    }

    /// Resolves every sub-select inside a WHERE expression.
    fn resolve_expr<'a>(
        &'a self,
        expr: Expr,
        scope: &'a [String],
        metadata: &'a mut FederationMetadata,
    ) -> BoxFuture<'a, EngineResult<Expr>> {
        async move {
            Ok(match expr {
                Expr::Binary { op, left, right } => {
                    let left = self.resolve_expr(*left, scope, metadata).await?;
                    match (op, *right) {
                        (BinaryOp::In | BinaryOp::NotIn, Expr::SubSelect(inner)) => {
                            match self.resolve_sub_select(*inner, scope, metadata).await? {
                                Resolved::Correlated(s) => {
                                    Expr::binary(op, left, Expr::SubSelect(Box::new(s)))
                                }
                                Resolved::Rows(rows) if rows.rows.is_empty() => {
                                    Expr::boolean(op == BinaryOp::NotIn)
                                }
                                Resolved::Rows(rows) => Expr::binary(op, left, rows_literal(&rows)),
                            }
                        }
                        (op, right) => {
                            let right = self.resolve_expr(right, scope, metadata).await?;
                            Expr::binary(op, left, right)
                        }
                    }
                }
                Expr::Unary { op, expr } => match (op, *expr) {
                    (UnaryOp::Exists | UnaryOp::NotExists, Expr::SubSelect(inner)) => {
                        match self.resolve_sub_select(*inner, scope, metadata).await? {
                            Resolved::Correlated(s) => Expr::Unary {
                                op,
                                expr: Box::new(Expr::SubSelect(Box::new(s))),
                            },
                            Resolved::Rows(rows) => {
                                Expr::boolean(rows.rows.is_empty() == (op == UnaryOp::NotExists))
                            }
                        }
                    }
                    (op, inner) => Expr::Unary {
                        op,
                        expr: Box::new(self.resolve_expr(inner, scope, metadata).await?),
                    },
                },
                Expr::SubSelect(inner) => {
                    match self.resolve_sub_select(*inner, scope, metadata).await? {
                        Resolved::Correlated(s) => Expr::SubSelect(Box::new(s)),
                        Resolved::Rows(rows) => scalar_literal(&rows)?,
                    }
                }
                Expr::Function { name, args } => {
                    let mut resolved = Vec::with_capacity(args.len());
                    for arg in args {
                        resolved.push(self.resolve_expr(arg, scope, metadata).await?);
                    }
                    Expr::Function {
                        name,
                        args: resolved,
                    }
                }
                Expr::List(values) => {
                    let mut resolved = Vec::with_capacity(values.len());
                    for value in values {
                        resolved.push(self.resolve_expr(value, scope, metadata).await?);
                    }
                    Expr::List(resolved)
                }
                leaf => leaf,
            })
        }
        .boxed()
    }

    async fn resolve_sub_select(
        &self,
        inner: Select,
        scope: &[String],
        metadata: &mut FederationMetadata,
    ) -> EngineResult<Resolved> {
        metadata.sub_selects_resolved += 1;
        let mut nested = FederationMetadata::default();
        if references_scope(&inner, scope) {
            let rebuilt = self.resolve(inner, scope, &mut nested).await?;
            metadata.merge(nested);
            return Ok(Resolved::Correlated(rebuilt));
        }
        let rebuilt = self.resolve(inner, &[], &mut nested).await?;
        metadata.merge(nested);
        let sql = render_select(&rebuilt);
        tracing::debug!(sql = %sql, "Materializing sub-select");
        Ok(Resolved::Rows(self.run(&sql, metadata).await?))
    }
}

/// Real collections of a level, in FROM order.
fn collections_of(select: &Select) -> Vec<CollectionDescriptor> {
    select
        .from
        .iter()
        .filter_map(|item| match &item.source {
            TableSource::Table(name) => Some(CollectionDescriptor {
                name: name.clone(),
                alias: item.name().unwrap_or(name).to_string(),
                join_kind: item.join_kind(),
                join_condition: item.join.as_ref().and_then(|j| j.on.clone()),
            }),
            _ => None,
        })
        .collect()
}

fn expr_refs(expr: &Expr, out: &mut Vec<ColumnRef>) {
    let mut nested = Vec::new();
    expr.visit(&mut |e| match e {
        Expr::Column(c) => out.push(c.clone()),
        Expr::SubSelect(s) => nested.push(s.as_ref()),
        _ => {}
    });
    for s in nested {
        deep_column_refs(s, out);
    }
}

/// Column references of `select`, descending into every nested sub-select.
fn deep_column_refs(select: &Select, out: &mut Vec<ColumnRef>) {
    for column in &select.columns {
        expr_refs(&column.expr, out);
    }
    for item in &select.from {
        if let Some(on) = item.join.as_ref().and_then(|j| j.on.as_ref()) {
            expr_refs(on, out);
        }
        if let TableSource::SubSelect(s) = &item.source {
            deep_column_refs(s, out);
        }
    }
    for expr in select
        .selection
        .iter()
        .chain(&select.group_by)
        .chain(&select.having)
        .chain(select.order_by.iter().map(|o| &o.expr))
    {
        expr_refs(expr, out);
    }
}

/// True when `select` refers to an alias of `scope` it does not define itself.
fn references_scope(select: &Select, scope: &[String]) -> bool {
    let own = select.aliases();
    let mut refs = Vec::new();
    deep_column_refs(select, &mut refs);
    refs.iter().any(|r| {
        r.table
            .as_deref()
            .is_some_and(|t| !own.contains(&t) && scope.iter().any(|s| s == t))
    })
}

/// Columns each collection must deliver: everything referenced outside the
/// pushed predicates.
fn referenced_columns(
    select: &Select,
    collections: &[CollectionDescriptor],
    classification: &ClassificationResult,
) -> BTreeMap<String, Vec<String>> {
    let mut refs = Vec::new();
    let without_selection = Select {
        selection: None,
        ..select.clone()
    };
    deep_column_refs(&without_selection, &mut refs);
    for conjunct in &classification.residual {
        expr_refs(conjunct, &mut refs);
    }

    // Bare names left by the normalizer in GROUP BY, HAVING and ORDER BY
    // belong to the first collection unless they name an output column.
    let outputs = select.projection_aliases();
    let default = select.default_table();

    collections
        .iter()
        .map(|collection| {
            let alias = collection.alias.as_str();
            let mut set = ColumnSet::named(Vec::<String>::new());
            for r in &refs {
                let owned = match r.table.as_deref() {
                    Some(table) => table == alias,
                    None => default == Some(alias) && !outputs.contains(&r.column.as_str()),
                };
                if owned {
                    set.insert(r.column.clone());
                }
            }
            (collection.alias.clone(), set.columns().to_vec())
        })
        .collect()
}

fn column_set(select: &Select, alias: &str, referenced: &BTreeMap<String, Vec<String>>) -> ColumnSet {
    let wildcard = select.columns.iter().any(|c| match &c.expr {
        Expr::Wildcard { table: None } => true,
        Expr::Wildcard { table: Some(t) } => t == alias,
        _ => false,
    });
    if wildcard {
        ColumnSet::All
    } else {
        ColumnSet::named(referenced.get(alias).cloned().unwrap_or_default())
    }
}

/// Grouping the backend can run itself: a single collection, nothing
/// residual, no HAVING, supported aggregates only, and every plain
/// projection column grouped.
fn pushdown_grouping(
    select: &Select,
    collections: &[CollectionDescriptor],
    capability: &CapabilityDescriptor,
    classification: &ClassificationResult,
) -> Option<(Vec<String>, Vec<Aggregate>)> {
    if !capability.supports_group_by
        || !classification.residual.is_empty()
        || select.having.is_some()
        || select.from.len() != 1
    {
        return None;
    }
    let [collection] = collections else {
        return None;
    };
    let alias = collection.alias.as_str();

    let mut group_by = Vec::new();
    for expr in &select.group_by {
        match expr {
            Expr::Column(c) if c.table.as_deref().map_or(true, |t| t == alias) => {
                group_by.push(c.column.clone())
            }
            _ => return None,
        }
    }

    let mut aggregates: Vec<Aggregate> = Vec::new();
    for column in &select.columns {
        if let Some((table, aggregate)) = as_aggregate(&column.expr) {
            if table.is_some_and(|t| t != alias)
                || !capability.supports_projection_function(&aggregate.function)
            {
                return None;
            }
            if !aggregates.contains(&aggregate) {
                aggregates.push(aggregate);
            }
            continue;
        }
        match &column.expr {
            Expr::Column(c) if c.table.as_deref() == Some(alias) && group_by.contains(&c.column) => {}
            _ => return None,
        }
    }
    if aggregates.is_empty() {
        return None;
    }

    let order_ok = select.order_by.iter().all(|o| match as_aggregate(&o.expr) {
        Some((_, aggregate)) => aggregates.contains(&aggregate),
        None => o.expr.column_refs().iter().all(|c| match &c.table {
            None => true,
            Some(t) => t == alias && group_by.contains(&c.column),
        }),
    });
    order_ok.then_some((group_by, aggregates))
}

fn value_literal(value: &Value) -> Expr {
    match value {
        Value::Null => Expr::null(),
        Value::Bool(b) => Expr::boolean(*b),
        Value::Int(i) => Expr::number(i),
        Value::Float(f) if f.is_finite() => Expr::number(f),
        Value::Float(_) => Expr::null(),
        Value::Text(s) => Expr::string(s.clone()),
        Value::Array(values) => Expr::List(values.iter().map(value_literal).collect()),
        other => Expr::string(other.to_json().to_string()),
    }
}

/// IN-list form of a result: values for one column, row tuples otherwise.
fn rows_literal(result: &QueryResult) -> Expr {
    Expr::List(
        result
            .rows
            .iter()
            .map(|row| match row.values.as_slice() {
                [single] => value_literal(single),
                values => Expr::List(values.iter().map(value_literal).collect()),
            })
            .collect(),
    )
}

/// Scalar form of a result: NULL for no rows, the value for one row.
fn scalar_literal(result: &QueryResult) -> EngineResult<Expr> {
    match result.rows.as_slice() {
        [] => Ok(Expr::null()),
        [row] => Ok(match row.values.as_slice() {
            [single] => value_literal(single),
            values => Expr::List(values.iter().map(value_literal).collect()),
        }),
        _ => Err(EngineError::execution_error(format!(
            "scalar sub-select returned {} rows",
            result.rows.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::BackendKind;
    use crate::engine::types::{ColumnInfo, Row};
    use crate::query::LiteralKind;

    fn result(values: Vec<Vec<Value>>) -> QueryResult {
        QueryResult {
            columns: vec![ColumnInfo {
                name: "v".into(),
                data_type: "BIGINT".into(),
                nullable: true,
            }],
            rows: values.into_iter().map(|values| Row { values }).collect(),
            execution_time_ms: 0.0,
        }
    }

    fn grouping_caps() -> CapabilityDescriptor {
        CapabilityDescriptor::new(BackendKind::Xml)
            .with_literals(&[LiteralKind::String])
            .with_operators(&[(BinaryOp::Eq, "=")])
            .with_projection_functions(&["count"])
            .grouping(true)
    }

    fn prepared(sql: &str) -> (Select, Vec<CollectionDescriptor>) {
        let select = normalize(parse_select(sql).unwrap());
        let collections = collections_of(&select);
        (select, collections)
    }

    #[test]
    fn single_column_results_become_lists() {
        let rows = result(vec![vec![Value::Int(1)], vec![Value::Text("a".into())]]);
        assert_eq!(
            rows_literal(&rows),
            Expr::List(vec![Expr::number(1), Expr::string("a")])
        );
    }

    #[test]
    fn scalar_results() {
        assert_eq!(scalar_literal(&result(Vec::new())).unwrap(), Expr::null());
        assert_eq!(
            scalar_literal(&result(vec![vec![Value::Float(2.5)]])).unwrap(),
            Expr::number(2.5)
        );
        assert!(scalar_literal(&result(vec![vec![Value::Null], vec![Value::Null]])).is_err());
    }

    #[test]
    fn correlation_is_detected_through_nesting() {
        let inner = parse_select("SELECT 1 FROM b WHERE b.aid = a.id").unwrap();
        assert!(references_scope(&inner, &["a".to_string()]));
        assert!(!references_scope(&inner, &["c".to_string()]));
        let own = parse_select("SELECT 1 FROM a WHERE a.id = 1").unwrap();
        assert!(!references_scope(&own, &["a".to_string()]));
    }

    #[test]
    fn referenced_columns_skip_pushed_predicates() {
        let (select, collections) =
            prepared("SELECT name FROM parks WHERE city = 'X' ORDER BY area");
        let classification = classify(
            select.selection.as_ref(),
            &collections,
            &grouping_caps(),
            &Default::default(),
        );
        let referenced = referenced_columns(&select, &collections, &classification);
        assert_eq!(referenced["parks"], vec!["name".to_string(), "area".to_string()]);
        assert_eq!(
            column_set(&select, "parks", &referenced),
            ColumnSet::named(["name", "area"])
        );
    }

    #[test]
    fn wildcards_request_every_column() {
        let (select, _) = prepared("SELECT p.* FROM parks p");
        assert!(column_set(&select, "p", &BTreeMap::new()).is_all());
    }

    #[test]
    fn grouping_is_pushed_when_everything_is_grouped() {
        let (select, collections) = prepared("SELECT city, count(*) FROM parks GROUP BY city");
        let classification = ClassificationResult::default();
        let (group_by, aggregates) =
            pushdown_grouping(&select, &collections, &grouping_caps(), &classification).unwrap();
        assert_eq!(group_by, vec!["city".to_string()]);
        assert_eq!(aggregates[0].output_name(), "_func__count__all");
    }

    #[test]
    fn grouping_stays_local_otherwise() {
        let caps = grouping_caps();
        let none = ClassificationResult::default();
        for sql in [
            "SELECT city, name, count(*) FROM parks GROUP BY city",
            "SELECT city, sum(area) FROM parks GROUP BY city",
            "SELECT city, count(*) FROM parks GROUP BY city HAVING count(*) > 1",
            "SELECT city FROM parks GROUP BY city",
        ] {
            let (select, collections) = prepared(sql);
            assert!(pushdown_grouping(&select, &collections, &caps, &none).is_none(), "{sql}");
        }
        let (select, collections) = prepared("SELECT count(*) FROM parks");
        let residual = ClassificationResult {
            residual: vec![Expr::boolean(true)],
            ..Default::default()
        };
        assert!(pushdown_grouping(&select, &collections, &caps, &residual).is_none());
    }
}

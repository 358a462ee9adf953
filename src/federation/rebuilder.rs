// SPDX-License-Identifier: BUSL-1.1

//! AST reconstruction.
//!
//! Swaps every fetched FROM entry for an inline VALUES table holding the
//! standardized rows, re-attaches the residual conjuncts and rewrites column
//! references that crossed a combined join or a pushed-down aggregation.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value as Json;

use crate::federation::capability::GEOMETRY_COLUMN;
use crate::federation::types::{
    joined_column_name, Aggregate, ColumnKind, ColumnTypeMap, FetchResult, GeometryEncoding,
};
use crate::query::{
    Column, ColumnRef, Expr, FromItem, InlineTable, Literal, OrderBy, Select, TableSource,
};

/// Projection functions that aggregate over a group.
pub const AGGREGATE_FUNCTIONS: &[&str] = &["count", "sum", "avg", "min", "max"];

/// Placeholder column of an empty result nothing references.
const EMPTY_COLUMN: &str = "_empty";

/// Reads `count(*)` / `count(t.c)` style calls as an aggregate.
pub fn as_aggregate(expr: &Expr) -> Option<(Option<&str>, Aggregate)> {
    let Expr::Function { name, args } = expr else {
        return None;
    };
    let function = name.to_ascii_lowercase();
    if !AGGREGATE_FUNCTIONS.contains(&function.as_str()) {
        return None;
    }
    match args.as_slice() {
        [Expr::Wildcard { table }] => Some((
            table.as_deref(),
            Aggregate {
                function,
                column: None,
            },
        )),
        [Expr::Column(column)] => Some((
            column.table.as_deref(),
            Aggregate {
                function,
                column: Some(column.column.clone()),
            },
        )),
        _ => None,
    }
}

/// Everything the rebuild needs besides the query itself.
pub struct RebuildContext<'a> {
    pub results: &'a [FetchResult],
    pub residual: Vec<Expr>,
    /// Aggregates the backend already computed, keyed by the grouped alias
    pub pushed_aggregates: Option<(&'a str, &'a [Aggregate])>,
    pub geometry_parser: &'a dyn Fn(GeometryEncoding) -> Option<&'static str>,
}

/// The rebuilt query plus any lossy conversions made on the way.
#[derive(Debug, Clone)]
pub struct Rebuilt {
    pub select: Select,
    pub warnings: Vec<String>,
}

pub fn rebuild(select: Select, ctx: RebuildContext<'_>) -> Rebuilt {
    let mut warnings = Vec::new();

    let mut replaced: BTreeMap<&str, &FetchResult> = BTreeMap::new();
    for result in ctx.results {
        for source in &result.sources {
            replaced.insert(source.as_str(), result);
        }
    }

    let mut from = Vec::with_capacity(select.from.len());
    for item in select.from {
        let Some(result) = item.name().and_then(|n| replaced.get(n)).copied() else {
            from.push(item);
            continue;
        };
        // Later members of a combined join are already inside the first one.
        if item.name() != result.sources.first().map(String::as_str) {
            continue;
        }
        let source = inline_source(result, ctx.geometry_parser, &mut warnings);
        from.push(FromItem {
            source,
            alias: Some(result.alias.clone()),
            join: item.join,
        });
    }

    let mut select = Select {
        from,
        selection: Some(Expr::and_chain(ctx.residual)),
        ..select
    };

    let renames: BTreeMap<String, String> = ctx
        .results
        .iter()
        .filter(|r| r.is_combined())
        .flat_map(|r| r.sources.iter().map(|s| (s.clone(), r.alias.clone())))
        .collect();
    if !renames.is_empty() {
        select = rewrite_combined(select, &renames);
    }

    if let Some((alias, aggregates)) = ctx.pushed_aggregates {
        select = rewrite_aggregates(select, alias, aggregates);
    }

    Rebuilt { select, warnings }
}

/// Column list of a result: row keys in first-seen order, then every
/// referenced column the rows lack.
fn result_columns(result: &FetchResult) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut columns = Vec::new();
    let mut add = |name: &str, columns: &mut Vec<String>| {
        if seen.insert(name.to_string()) {
            columns.push(name.to_string());
        }
    };
    for row in &result.rows {
        for key in row.properties.keys() {
            add(key, &mut columns);
        }
    }
    for column in &result.columns {
        add(column, &mut columns);
    }
    if !result.is_combined() {
        add(GEOMETRY_COLUMN, &mut columns);
    }
    columns
}

/// Primitive kind per column, taken from the first row and falling back to
/// the first row with a non-null value.
pub fn column_types(result: &FetchResult, columns: &[String]) -> ColumnTypeMap {
    columns
        .iter()
        .map(|column| {
            let kind = result
                .rows
                .iter()
                .filter_map(|row| row.properties.get(column))
                .map(ColumnKind::of)
                .find(|k| *k != ColumnKind::Null)
                .unwrap_or(ColumnKind::Null);
            (column.clone(), kind)
        })
        .collect()
}

fn inline_source(
    result: &FetchResult,
    parser: &dyn Fn(GeometryEncoding) -> Option<&'static str>,
    warnings: &mut Vec<String>,
) -> TableSource {
    if result.rows.is_empty() {
        return empty_source(result);
    }

    let columns = result_columns(result);
    let types = column_types(result, &columns);
    let parser = parser(result.encoding);
    let mut lossy = BTreeSet::new();

    let rows = result
        .rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|column| {
                    let is_geometry = if result.is_combined() {
                        result.geometry_columns.contains(column)
                    } else {
                        column == GEOMETRY_COLUMN
                    };
                    if is_geometry {
                        let text = if result.is_combined() {
                            row.properties.get(column).and_then(Json::as_str)
                        } else {
                            row.geometry.as_deref()
                        };
                        return geometry_literal(text, parser);
                    }
                    let kind = types.get(column).copied().unwrap_or(ColumnKind::Null);
                    let value = row.properties.get(column).unwrap_or(&Json::Null);
                    to_literal(value, kind).unwrap_or_else(|| {
                        lossy.insert(column.clone());
                        Expr::null()
                    })
                })
                .collect()
        })
        .collect();

    for column in lossy {
        let message = format!(
            "column '{column}' of '{}' has values that do not match its {:?} type; they were replaced by NULL",
            result.alias,
            types.get(&column).copied().unwrap_or(ColumnKind::Null)
        );
        tracing::warn!("{message}");
        warnings.push(message);
    }

    TableSource::Values(InlineTable { columns, rows })
}

/// `SELECT * FROM (VALUES (NULL, ..)) WHERE false`: the referenced columns
/// exist but no row does.
fn empty_source(result: &FetchResult) -> TableSource {
    let mut columns = result_columns(result);
    if columns.is_empty() {
        columns.push(EMPTY_COLUMN.to_string());
    }
    let alias = result.alias.clone();
    let values = FromItem {
        source: TableSource::Values(InlineTable {
            rows: vec![columns.iter().map(|_| Expr::null()).collect()],
            columns,
        }),
        alias: Some(alias),
        join: None,
    };
    TableSource::SubSelect(Box::new(Select {
        selection: Some(Expr::boolean(false)),
        ..Select::wildcard(vec![values])
    }))
}

fn geometry_literal(text: Option<&str>, parser: Option<&'static str>) -> Expr {
    match (text, parser) {
        (None, _) => Expr::null(),
        (Some(text), Some(parser)) => Expr::function(parser, vec![Expr::string(text)]),
        (Some(text), None) => Expr::string(text),
    }
}

/// Literal for `value` in a column of `kind`. `None` when the value cannot be
/// represented; genuine nulls stay null.
pub fn to_literal(value: &Json, kind: ColumnKind) -> Option<Expr> {
    if value.is_null() {
        return Some(Expr::null());
    }
    let literal = match (kind, value) {
        (ColumnKind::Number, Json::Number(n)) => Literal::Number(n.to_string()),
        (ColumnKind::Number, Json::String(s)) => {
            let trimmed = s.trim();
            trimmed.parse::<f64>().ok().filter(|f| f.is_finite())?;
            Literal::Number(trimmed.to_string())
        }
        (ColumnKind::Number, Json::Bool(b)) => Literal::Number(u8::from(*b).to_string()),
        (ColumnKind::Bool, Json::Bool(b)) => Literal::Bool(*b),
        (ColumnKind::Bool, Json::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Literal::Bool(true),
            "false" => Literal::Bool(false),
            _ => return None,
        },
        (ColumnKind::Number | ColumnKind::Bool, _) => return None,
        (_, Json::String(s)) => Literal::String(s.clone()),
        (_, Json::Number(n)) => Literal::String(n.to_string()),
        (_, Json::Bool(b)) => Literal::String(b.to_string()),
        (_, other) => Literal::String(other.to_string()),
    };
    Some(Expr::Literal(literal))
}

/// Points references to joined aliases at the combined row source.
fn rewrite_combined(select: Select, renames: &BTreeMap<String, String>) -> Select {
    let mut rewrite = |expr: Expr| {
        expr.transform(&mut |e| match e {
            Expr::Column(ColumnRef {
                table: Some(table),
                column,
            }) => match renames.get(&table) {
                Some(combined) => Expr::column(combined, joined_column_name(&table, &column)),
                None => Expr::Column(ColumnRef::qualified(table, column)),
            },
            Expr::Wildcard { table: Some(table) } => Expr::Wildcard {
                table: Some(renames.get(&table).cloned().unwrap_or(table)),
            },
            other => other,
        })
    };

    let mut projected = BTreeSet::new();
    let columns = select
        .columns
        .into_iter()
        .filter_map(|column| {
            let relabel = match (&column.expr, &column.alias) {
                (Expr::Column(c), None) if c.table.as_ref().is_some_and(|t| renames.contains_key(t)) => {
                    Some(c.column.clone())
                }
                _ => None,
            };
            let expr = rewrite(column.expr);
            // `a.*, b.*` both became the combined wildcard.
            if matches!(expr, Expr::Wildcard { .. }) && !projected.insert(expr.to_string()) {
                return None;
            }
            Some(Column {
                expr,
                alias: column.alias.or(relabel),
            })
        })
        .collect();

    Select {
        columns,
        from: select
            .from
            .into_iter()
            .map(|mut item| {
                if let Some(join) = item.join.as_mut() {
                    join.on = join.on.take().map(&mut rewrite);
                }
                item
            })
            .collect(),
        selection: select.selection.map(&mut rewrite),
        group_by: select.group_by.into_iter().map(&mut rewrite).collect(),
        having: select.having.map(&mut rewrite),
        order_by: select
            .order_by
            .into_iter()
            .map(|o| OrderBy {
                expr: rewrite(o.expr),
                asc: o.asc,
            })
            .collect(),
        ..select
    }
}

/// Replaces aggregate calls with the pseudo-columns the backend returned and
/// drops the grouping it already applied.
fn rewrite_aggregates(select: Select, alias: &str, aggregates: &[Aggregate]) -> Select {
    let mut rewrite = |expr: Expr| {
        expr.transform(&mut |e| match as_aggregate(&e) {
            Some((_, aggregate)) if aggregates.contains(&aggregate) => {
                Expr::column(alias, aggregate.output_name())
            }
            _ => e,
        })
    };

    let columns = select
        .columns
        .into_iter()
        .map(|column| {
            let label = match (&column.alias, as_aggregate(&column.expr)) {
                (None, Some((_, aggregate))) => Some(aggregate.function),
                _ => None,
            };
            Column {
                expr: rewrite(column.expr),
                alias: column.alias.or(label),
            }
        })
        .collect();

    Select {
        columns,
        group_by: Vec::new(),
        having: select.having.map(&mut rewrite),
        order_by: select
            .order_by
            .into_iter()
            .map(|o| OrderBy {
                expr: rewrite(o.expr),
                asc: o.asc,
            })
            .collect(),
        ..select
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::normalizer::normalize;
    use crate::federation::types::StandardRow;
    use crate::query::{parse_select, render_select};
    use serde_json::json;

    fn row(geometry: Option<&str>, properties: Json) -> StandardRow {
        StandardRow {
            geometry: geometry.map(str::to_string),
            properties: properties.as_object().cloned().unwrap_or_default(),
        }
    }

    fn result(alias: &str, rows: Vec<StandardRow>, columns: &[&str]) -> FetchResult {
        FetchResult {
            table: alias.into(),
            alias: alias.into(),
            sources: vec![alias.into()],
            rows,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            encoding: GeometryEncoding::GeoJson,
            geometry_columns: Vec::new(),
        }
    }

    fn no_parser(_: GeometryEncoding) -> Option<&'static str> {
        None
    }

    fn run(sql: &str, results: &[FetchResult], residual: Vec<Expr>) -> String {
        let select = normalize(parse_select(sql).unwrap());
        let rebuilt = rebuild(
            select,
            RebuildContext {
                results,
                residual,
                pushed_aggregates: None,
                geometry_parser: &no_parser,
            },
        );
        render_select(&rebuilt.select)
    }

    #[test]
    fn quotes_are_doubled() {
        let rows = vec![row(None, json!({"name": "O'Brien"}))];
        let sql = run("SELECT name FROM parks", &[result("parks", rows, &["name"])], Vec::new());
        assert_eq!(
            sql,
            "SELECT \"parks\".\"name\" FROM (VALUES ('O''Brien', NULL)) AS \"parks\"(\"name\", \"geometry\") WHERE TRUE"
        );
    }

    #[test]
    fn empty_result_becomes_false_sub_select() {
        let sql = run(
            "SELECT name FROM parks WHERE city = 'X'",
            &[result("parks", Vec::new(), &["name", "city"])],
            Vec::new(),
        );
        assert_eq!(
            sql,
            "SELECT \"parks\".\"name\" FROM (SELECT * FROM (VALUES (NULL, NULL, NULL)) AS \"parks\"(\"name\", \"city\", \"geometry\") WHERE FALSE) AS \"parks\" WHERE TRUE"
        );
    }

    #[test]
    fn residual_is_and_chained_in_order() {
        let residual = vec![
            Expr::binary(crate::query::BinaryOp::Gt, Expr::column("p", "n"), Expr::number(1)),
            Expr::binary(crate::query::BinaryOp::Lt, Expr::column("p", "n"), Expr::number(9)),
        ];
        let rows = vec![row(None, json!({"n": 3}))];
        let sql = run("SELECT * FROM parks p", &[result("p", rows, &[])], residual);
        assert!(sql.ends_with("WHERE (\"p\".\"n\" > 1) AND (\"p\".\"n\" < 9)"), "{sql}");
    }

    #[test]
    fn geometry_is_parsed_when_the_engine_can() {
        let rows = vec![row(Some("{\"type\":\"Point\",\"coordinates\":[1,2]}"), json!({}))];
        let select = normalize(parse_select("SELECT * FROM t").unwrap());
        let results = [result("t", rows, &[])];
        let parser = |_: GeometryEncoding| Some("ST_GeomFromGeoJSON");
        let rebuilt = rebuild(
            select,
            RebuildContext {
                results: &results,
                residual: Vec::new(),
                pushed_aggregates: None,
                geometry_parser: &parser,
            },
        );
        assert!(render_select(&rebuilt.select)
            .contains("ST_GeomFromGeoJSON('{\"type\":\"Point\",\"coordinates\":[1,2]}')"));
    }

    #[test]
    fn nulls_are_never_zero() {
        assert_eq!(to_literal(&Json::Null, ColumnKind::Number), Some(Expr::null()));
        assert_eq!(to_literal(&json!("12"), ColumnKind::Number), Some(Expr::number("12")));
        assert_eq!(to_literal(&json!("abc"), ColumnKind::Number), None);
        assert_eq!(to_literal(&json!(7), ColumnKind::String), Some(Expr::string("7")));
    }

    #[test]
    fn lossy_values_are_reported() {
        let rows = vec![row(None, json!({"n": 1})), row(None, json!({"n": "many"}))];
        let select = normalize(parse_select("SELECT n FROM t").unwrap());
        let results = [result("t", rows, &["n"])];
        let rebuilt = rebuild(
            select,
            RebuildContext {
                results: &results,
                residual: Vec::new(),
                pushed_aggregates: None,
                geometry_parser: &no_parser,
            },
        );
        assert_eq!(rebuilt.warnings.len(), 1);
        assert!(render_select(&rebuilt.select).contains("(1, NULL), (NULL, NULL)"));
    }

    #[test]
    fn combined_join_rewrites_references() {
        let rows = vec![row(None, json!({"a__name": "x", "b__aid": 1, "a__id": 1}))];
        let combined = FetchResult {
            table: "a__b".into(),
            alias: "a__b".into(),
            sources: vec!["a".into(), "b".into()],
            rows,
            columns: vec!["a__name".into(), "a__id".into(), "b__aid".into()],
            encoding: GeometryEncoding::Gml,
            geometry_columns: vec!["a__geometry".into(), "b__geometry".into()],
        };
        let sql = run(
            "SELECT a.name, b.aid AS ref FROM a JOIN b ON a.id = b.aid ORDER BY a.name",
            &[combined],
            Vec::new(),
        );
        assert_eq!(
            sql,
            "SELECT \"a__b\".\"a__name\" AS \"name\", \"a__b\".\"b__aid\" AS \"ref\" FROM (VALUES (1, 'x', 1)) AS \"a__b\"(\"a__id\", \"a__name\", \"b__aid\") WHERE TRUE ORDER BY \"a__b\".\"a__name\""
        );
    }

    #[test]
    fn pushed_aggregates_become_columns() {
        let rows = vec![row(None, json!({"city": "X", "_func__count__all": 4}))];
        let select = normalize(parse_select("SELECT city, count(*) FROM t GROUP BY city").unwrap());
        let results = [result("t", rows, &["city", "_func__count__all"])];
        let aggregates = [Aggregate {
            function: "count".into(),
            column: None,
        }];
        let rebuilt = rebuild(
            select,
            RebuildContext {
                results: &results,
                residual: Vec::new(),
                pushed_aggregates: Some(("t", &aggregates)),
                geometry_parser: &no_parser,
            },
        );
        let sql = render_select(&rebuilt.select);
        assert!(sql.starts_with(
            "SELECT \"t\".\"city\", \"t\".\"_func__count__all\" AS \"count\" FROM"
        ));
        assert!(!sql.contains("GROUP BY"));
    }

    #[test]
    fn aggregate_detection() {
        let star = Expr::function("COUNT", vec![Expr::Wildcard { table: None }]);
        assert_eq!(
            as_aggregate(&star).map(|(_, a)| a.output_name()),
            Some("_func__count__all".to_string())
        );
        assert!(as_aggregate(&Expr::function("upper", vec![Expr::column("t", "a")])).is_none());
    }
}

// SPDX-License-Identifier: BUSL-1.1

//! Retrieval orchestration.
//!
//! Runs the optional probe, decides between one fetch per collection and a
//! single backend-side join, issues the fetches concurrently and
//! standardizes what comes back. Any failure aborts the whole retrieval.

use std::collections::BTreeMap;
use std::time::Instant;

use futures::future::try_join_all;
use tracing::{instrument, Instrument};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::BackendDriver;
use crate::federation::capability::{CapabilityDescriptor, GEOMETRY_COLUMN};
use crate::federation::types::{
    joined_column_name, Aggregate, BackendVariant, CollectionDescriptor, CollectionScan,
    FetchRequest, FetchResult, SourceFetchResult, StandardRow,
};
use crate::query::{BinaryOp, Expr, JoinKind};

/// What to fetch for one query level.
#[derive(Debug, Clone)]
pub struct RetrievalPlan {
    /// One scan per real FROM entry, in FROM order
    pub scans: Vec<CollectionScan>,
    /// Columns the query references per alias
    pub referenced: BTreeMap<String, Vec<String>>,
    /// Backend-side grouping, only honored for a single scan
    pub group_by: Vec<String>,
    pub aggregates: Vec<Aggregate>,
    pub variant: BackendVariant,
    /// Whether a backend-side join may be used
    pub combine: bool,
}

/// Standardized results plus their per-source statistics.
#[derive(Debug, Default)]
pub struct Retrieval {
    pub results: Vec<FetchResult>,
    pub sources: Vec<SourceFetchResult>,
    pub total_rows: u64,
}

/// Runs the driver's probe against the first collection, if it wants one.
///
/// Returns the discovered variant and the time spent.
pub async fn probe(
    driver: &dyn BackendDriver,
    collections: &[CollectionDescriptor],
) -> EngineResult<(BackendVariant, f64)> {
    let Some(first) = collections.first() else {
        return Ok((BackendVariant::default(), 0.0));
    };
    if !driver.capabilities().requires_probe {
        return Ok((BackendVariant::default(), 0.0));
    }
    let start = Instant::now();
    let variant = driver.probe(&first.name).await?;
    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
    tracing::debug!(collection = %first.name, elapsed_ms = elapsed, "Probe complete");
    Ok((variant, elapsed))
}

/// True when `scans` can be served by one backend-side join.
///
/// Needs exactly two collections joined by an inner, left or right join on
/// an AND of column equalities between them. Outer joins also need explicit
/// column sets on both sides to build the unmatched-row skeleton.
pub fn can_combine(capability: &CapabilityDescriptor, scans: &[CollectionScan]) -> bool {
    if !capability.can_join {
        return false;
    }
    let [left, right] = scans else {
        return false;
    };
    let outer = match right.collection.join_kind {
        Some(JoinKind::Inner) => false,
        Some(JoinKind::Left) | Some(JoinKind::Right) => true,
        _ => return false,
    };
    if outer && (left.columns.is_all() || right.columns.is_all()) {
        return false;
    }
    right.collection.join_condition.as_ref().is_some_and(|on| {
        is_equi_join(on, &left.collection.alias, &right.collection.alias)
    })
}

fn is_equi_join(on: &Expr, a: &str, b: &str) -> bool {
    let conjuncts = on.conjuncts();
    !conjuncts.is_empty()
        && conjuncts.iter().all(|conjunct| {
            let Expr::Binary {
                op: BinaryOp::Eq,
                left,
                right,
            } = conjunct
            else {
                return false;
            };
            let (Expr::Column(l), Expr::Column(r)) = (left.as_ref(), right.as_ref()) else {
                return false;
            };
            if CapabilityDescriptor::is_ambiguous_column(&l.column)
                || CapabilityDescriptor::is_ambiguous_column(&r.column)
            {
                return false;
            }
            let tables = (l.table.as_deref(), r.table.as_deref());
            tables == (Some(a), Some(b)) || tables == (Some(b), Some(a))
        })
}

/// Fetches and standardizes every scan of `plan`.
#[instrument(skip_all, fields(driver = driver.driver_id(), scans = plan.scans.len()))]
pub async fn retrieve(driver: &dyn BackendDriver, plan: RetrievalPlan) -> EngineResult<Retrieval> {
    let requests = build_requests(driver.capabilities(), &plan);
    tracing::debug!(fetches = requests.len(), "Issuing fetches");

    let fetches = requests.into_iter().map(|(request, columns)| {
        let span = tracing::debug_span!("fetch", collection = %request.label());
        fetch_collection(driver, request, columns).instrument(span)
    });
    let fetched = try_join_all(fetches).await?;

    let mut retrieval = Retrieval::default();
    for (result, stats) in fetched {
        retrieval.total_rows += stats.row_count;
        retrieval.sources.push(stats);
        retrieval.results.push(result);
    }
    Ok(retrieval)
}

/// One request per scan, or a single joined request.
fn build_requests(
    capability: &CapabilityDescriptor,
    plan: &RetrievalPlan,
) -> Vec<(FetchRequest, Vec<String>)> {
    let referenced = |alias: &str| plan.referenced.get(alias).cloned().unwrap_or_default();

    if plan.combine && can_combine(capability, &plan.scans) {
        let columns = plan
            .scans
            .iter()
            .flat_map(|scan| {
                let alias = &scan.collection.alias;
                referenced(alias)
                    .into_iter()
                    .map(move |c| joined_column_name(alias, &c))
            })
            .collect();
        let request = FetchRequest {
            scans: plan.scans.clone(),
            group_by: Vec::new(),
            aggregates: Vec::new(),
            variant: plan.variant.clone(),
        };
        return vec![(request, columns)];
    }

    let grouped = plan.scans.len() == 1;
    plan.scans
        .iter()
        .map(|scan| {
            let mut request = FetchRequest::single(scan.clone(), plan.variant.clone());
            let mut columns = referenced(&scan.collection.alias);
            if grouped && (!plan.group_by.is_empty() || !plan.aggregates.is_empty()) {
                request.group_by = plan.group_by.clone();
                request.aggregates = plan.aggregates.clone();
                columns = plan
                    .group_by
                    .iter()
                    .cloned()
                    .chain(plan.aggregates.iter().map(Aggregate::output_name))
                    .collect();
            }
            (request, columns)
        })
        .collect()
}

async fn fetch_collection(
    driver: &dyn BackendDriver,
    request: FetchRequest,
    columns: Vec<String>,
) -> EngineResult<(FetchResult, SourceFetchResult)> {
    let label = request.label();
    let start = Instant::now();

    let wrap = |e: EngineError| {
        EngineError::execution_error(format!("Failed to fetch from '{label}': {e}"))
    };
    let raw = driver.fetch(&request).await.map_err(wrap)?;
    let rows: Vec<StandardRow> = driver.standardize(raw).map_err(wrap)?;

    let fetch_time_ms = start.elapsed().as_secs_f64() * 1000.0;
    tracing::debug!(collection = %label, rows = rows.len(), elapsed_ms = fetch_time_ms, "Fetched");

    let sources: Vec<String> = request
        .scans
        .iter()
        .map(|s| s.collection.alias.clone())
        .collect();
    let (alias, geometry_columns) = if request.is_join() {
        (
            sources.join("__"),
            sources
                .iter()
                .map(|a| joined_column_name(a, GEOMETRY_COLUMN))
                .collect(),
        )
    } else {
        (sources.first().cloned().unwrap_or_default(), Vec::new())
    };

    let stats = SourceFetchResult {
        alias: alias.clone(),
        collection: label.clone(),
        row_count: rows.len() as u64,
        fetch_time_ms,
    };
    let result = FetchResult {
        table: label,
        alias,
        sources,
        rows,
        columns,
        encoding: driver.geometry_encoding(&request.variant),
        geometry_columns,
    };
    Ok((result, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::BackendKind;
    use crate::federation::types::ColumnSet;

    fn scan(alias: &str, join: Option<(JoinKind, Expr)>, columns: ColumnSet) -> CollectionScan {
        let (join_kind, join_condition) = match join {
            Some((kind, on)) => (Some(kind), Some(on)),
            None => (None, None),
        };
        CollectionScan {
            collection: CollectionDescriptor {
                name: alias.into(),
                alias: alias.into(),
                join_kind,
                join_condition,
            },
            predicate: Expr::boolean(true),
            columns,
        }
    }

    fn on() -> Expr {
        Expr::binary(BinaryOp::Eq, Expr::column("a", "id"), Expr::column("b", "aid"))
    }

    fn joining() -> CapabilityDescriptor {
        CapabilityDescriptor::new(BackendKind::Xml).joins(true)
    }

    #[test]
    fn inner_equi_join_is_combined() {
        let scans = [
            scan("a", None, ColumnSet::All),
            scan("b", Some((JoinKind::Inner, on())), ColumnSet::All),
        ];
        assert!(can_combine(&joining(), &scans));
        assert!(!can_combine(
            &CapabilityDescriptor::new(BackendKind::Xml),
            &scans
        ));
    }

    #[test]
    fn outer_join_needs_named_columns() {
        let wildcard = [
            scan("a", None, ColumnSet::All),
            scan("b", Some((JoinKind::Left, on())), ColumnSet::named(["aid"])),
        ];
        assert!(!can_combine(&joining(), &wildcard));
        let named = [
            scan("a", None, ColumnSet::named(["id"])),
            scan("b", Some((JoinKind::Left, on())), ColumnSet::named(["aid"])),
        ];
        assert!(can_combine(&joining(), &named));
    }

    #[test]
    fn non_equality_and_full_joins_are_split() {
        let lt = Expr::binary(BinaryOp::Lt, Expr::column("a", "id"), Expr::column("b", "aid"));
        let scans = [
            scan("a", None, ColumnSet::All),
            scan("b", Some((JoinKind::Inner, lt)), ColumnSet::All),
        ];
        assert!(!can_combine(&joining(), &scans));
        let full = [
            scan("a", None, ColumnSet::named(["id"])),
            scan("b", Some((JoinKind::Full, on())), ColumnSet::named(["aid"])),
        ];
        assert!(!can_combine(&joining(), &full));
    }

    #[test]
    fn grouping_only_applies_to_single_scans() {
        let plan = RetrievalPlan {
            scans: vec![scan("a", None, ColumnSet::named(["city"]))],
            referenced: BTreeMap::from([("a".to_string(), vec!["city".to_string()])]),
            group_by: vec!["city".into()],
            aggregates: vec![Aggregate {
                function: "count".into(),
                column: None,
            }],
            variant: BackendVariant::default(),
            combine: true,
        };
        let requests = build_requests(&joining(), &plan);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.group_by, vec!["city".to_string()]);
        assert_eq!(
            requests[0].1,
            vec!["city".to_string(), "_func__count__all".to_string()]
        );
    }

    #[test]
    fn combined_request_names_columns_per_side() {
        let plan = RetrievalPlan {
            scans: vec![
                scan("a", None, ColumnSet::All),
                scan("b", Some((JoinKind::Inner, on())), ColumnSet::All),
            ],
            referenced: BTreeMap::from([
                ("a".to_string(), vec!["id".to_string()]),
                ("b".to_string(), vec!["aid".to_string()]),
            ]),
            group_by: Vec::new(),
            aggregates: Vec::new(),
            variant: BackendVariant::default(),
            combine: true,
        };
        let requests = build_requests(&joining(), &plan);
        assert_eq!(requests.len(), 1);
        assert!(requests[0].0.is_join());
        assert_eq!(requests[0].1, vec!["a__id".to_string(), "b__aid".to_string()]);
    }
}

// SPDX-License-Identifier: BUSL-1.1

//! AST normalization.
//!
//! Gives every FROM entry an alias and qualifies bare column references with
//! the first FROM entry, so later stages can assume `table.column` everywhere.
//! Nested sub-selects are left alone; each level is normalized when the
//! orchestrator descends into it.

use crate::query::{ColumnRef, Expr, FromItem, OrderBy, Select, TableSource};

/// Normalizes one query level. Idempotent.
pub fn normalize(select: Select) -> Select {
    let from: Vec<FromItem> = select
        .from
        .into_iter()
        .enumerate()
        .map(|(i, item)| assign_alias(item, i))
        .collect();

    let default_table = from.first().and_then(|f| f.name()).map(str::to_string);
    let Some(default_table) = default_table else {
        return Select { from, ..select };
    };

    let outputs: Vec<String> = select
        .columns
        .iter()
        .filter_map(|c| c.alias.clone())
        .collect();
    let qualify = |expr: Expr| qualify_columns(expr, &default_table, &[]);
    let qualify_outside_outputs = |expr: Expr| qualify_columns(expr, &default_table, &outputs);

    Select {
        distinct: select.distinct,
        columns: select
            .columns
            .into_iter()
            .map(|mut column| {
                column.expr = qualify(column.expr);
                column
            })
            .collect(),
        from,
        selection: select.selection.map(qualify),
        group_by: select.group_by.into_iter().map(qualify_outside_outputs).collect(),
        having: select.having.map(qualify_outside_outputs),
        order_by: select
            .order_by
            .into_iter()
            .map(|o| OrderBy {
                expr: qualify_outside_outputs(o.expr),
                asc: o.asc,
            })
            .collect(),
        limit: select.limit,
    }
}

fn assign_alias(item: FromItem, position: usize) -> FromItem {
    if item.alias.is_some() {
        return item;
    }
    let alias = match &item.source {
        TableSource::Table(name) => name.clone(),
        TableSource::SubSelect(_) | TableSource::Values(_) => format!("_subquery_{position}"),
    };
    FromItem {
        alias: Some(alias),
        ..item
    }
}

/// Qualifies bare references with `table`, except names listed in `keep`.
fn qualify_columns(expr: Expr, table: &str, keep: &[String]) -> Expr {
    expr.transform(&mut |e| match e {
        Expr::Column(ColumnRef {
            table: None,
            column,
        }) if !keep.contains(&column) => Expr::Column(ColumnRef::qualified(table, column)),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{parse_select, render_select, BinaryOp, Column};
    use proptest::prelude::*;

    #[test]
    fn aliases_and_qualifies() {
        let select = parse_select("SELECT name FROM parks WHERE city = 'X'").unwrap();
        let normalized = normalize(select);
        assert_eq!(normalized.from[0].alias.as_deref(), Some("parks"));
        assert_eq!(
            render_select(&normalized),
            "SELECT \"parks\".\"name\" FROM \"parks\" WHERE \"parks\".\"city\" = 'X'"
        );
    }

    #[test]
    fn bare_columns_default_to_first_table() {
        let select =
            parse_select("SELECT a.x, y FROM a JOIN b ON a.id = b.aid WHERE z > 1").unwrap();
        let normalized = normalize(select);
        let refs: Vec<_> = normalized
            .selection
            .as_ref()
            .unwrap()
            .column_refs()
            .into_iter()
            .cloned()
            .collect();
        assert_eq!(refs, vec![ColumnRef::qualified("a", "z")]);
        assert_eq!(normalized.columns[1].expr, Expr::column("a", "y"));
    }

    #[test]
    fn order_by_output_alias_stays_bare() {
        let select =
            parse_select("SELECT count(*) AS n, kind FROM t GROUP BY kind ORDER BY n").unwrap();
        let normalized = normalize(select);
        assert_eq!(normalized.order_by[0].expr, Expr::bare_column("n"));
        assert_eq!(normalized.group_by[0], Expr::column("t", "kind"));
    }

    #[test]
    fn derived_tables_get_synthetic_aliases() {
        let mut select = Select::wildcard(vec![FromItem {
            source: TableSource::SubSelect(Box::new(Select::wildcard(vec![FromItem::table("t")]))),
            alias: None,
            join: None,
        }]);
        select.selection = Some(Expr::binary(
            BinaryOp::Eq,
            Expr::bare_column("a"),
            Expr::number(1),
        ));
        let normalized = normalize(select);
        assert_eq!(normalized.from[0].alias.as_deref(), Some("_subquery_0"));
        assert_eq!(
            normalized.selection.unwrap().column_refs()[0],
            &ColumnRef::qualified("_subquery_0", "a")
        );
    }

    #[test]
    fn sub_selects_are_not_entered() {
        let select =
            parse_select("SELECT * FROM a WHERE x IN (SELECT y FROM b)").unwrap();
        let normalized = normalize(select);
        let Some(Expr::Binary { right, .. }) = normalized.selection else {
            panic!("expected IN");
        };
        let Expr::SubSelect(inner) = *right else {
            panic!("expected sub-select");
        };
        assert_eq!(inner.columns[0].expr, Expr::bare_column("y"));
    }

    fn arb_column() -> impl Strategy<Value = Expr> {
        (
            prop::option::of(prop::sample::select(vec!["a", "b"])),
            prop::sample::select(vec!["x", "y", "z"]),
        )
            .prop_map(|(table, column)| {
                Expr::Column(ColumnRef::new(table.map(str::to_string), column))
            })
    }

    fn arb_predicate() -> impl Strategy<Value = Expr> {
        let leaf = (arb_column(), any::<i32>())
            .prop_map(|(c, n)| Expr::binary(BinaryOp::Eq, c, Expr::number(n)));
        leaf.prop_recursive(3, 16, 2, |inner| {
            (inner.clone(), inner, prop::bool::ANY).prop_map(|(l, r, and)| {
                Expr::binary(if and { BinaryOp::And } else { BinaryOp::Or }, l, r)
            })
        })
    }

    fn arb_select() -> impl Strategy<Value = Select> {
        (
            prop::collection::vec(arb_column(), 1..4),
            prop::option::of(arb_predicate()),
            prop::bool::ANY,
        )
            .prop_map(|(columns, selection, aliased)| {
                let mut from = vec![FromItem::table("a")];
                let second = FromItem::table("b");
                from.push(if aliased { second.with_alias("b") } else { second });
                Select {
                    columns: columns.into_iter().map(Column::new).collect(),
                    selection,
                    ..Select::wildcard(from)
                }
            })
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(select in arb_select()) {
            let once = normalize(select);
            let twice = normalize(once.clone());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn normalized_where_has_no_bare_columns(select in arb_select()) {
            let normalized = normalize(select);
            if let Some(selection) = &normalized.selection {
                prop_assert!(selection.column_refs().iter().all(|c| c.table.is_some()));
            }
        }
    }
}

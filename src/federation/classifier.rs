// SPDX-License-Identifier: BUSL-1.1

//! Predicate classification.
//!
//! Splits a normalized WHERE tree into one pushable predicate per collection
//! and an ordered list of residual conjuncts that the relational engine
//! evaluates after retrieval.

use std::collections::BTreeMap;

use crate::engine::types::BackendKind;
use crate::federation::capability::CapabilityDescriptor;
use crate::federation::types::{
    is_nullable_side, BackendVariant, ClassificationResult, CollectionDescriptor,
};
use crate::query::{BinaryOp, ColumnRef, Expr, Literal, LiteralKind};

/// Where a supported subtree can run.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    /// References no table, or only unqualified columns
    Default,
    Table(String),
}

impl Scope {
    fn merge(self, other: Scope) -> Option<Scope> {
        match (self, other) {
            (Scope::Default, scope) | (scope, Scope::Default) => Some(scope),
            (Scope::Table(a), Scope::Table(b)) if a == b => Some(Scope::Table(a)),
            _ => None,
        }
    }
}

/// Classifies `selection` for `collections`. Never fails: anything that
/// cannot be proven pushable is residual.
pub fn classify(
    selection: Option<&Expr>,
    collections: &[CollectionDescriptor],
    capability: &CapabilityDescriptor,
    variant: &BackendVariant,
) -> ClassificationResult {
    let mut per_table: BTreeMap<String, Vec<Expr>> = collections
        .iter()
        .map(|c| (c.alias.clone(), Vec::new()))
        .collect();
    let mut shared = Vec::new();
    let mut residual = Vec::new();

    let conjuncts = selection.map(|s| s.conjuncts()).unwrap_or_default();
    let classifier = Classifier {
        capability,
        variant,
        aliases: collections.iter().map(|c| c.alias.as_str()).collect(),
    };

    for conjunct in conjuncts {
        match classifier.scope_of(conjunct) {
            // Filtering a null-extended side before the join would turn
            // its dropped rows into NULL rows that a null-accepting
            // predicate then lets through, so those conjuncts stay local.
            Some(Scope::Table(alias)) => {
                let nullable = collections
                    .iter()
                    .position(|c| c.alias == alias)
                    .is_some_and(|i| is_nullable_side(collections, i));
                if nullable {
                    residual.push(conjunct.clone());
                } else {
                    per_table.entry(alias).or_default().push(conjunct.clone());
                }
            }
            Some(Scope::Default) => shared.push(conjunct.clone()),
            None => residual.push(conjunct.clone()),
        }
    }

    let supported_by_table = per_table
        .into_iter()
        .map(|(alias, mut pushed)| {
            pushed.extend(shared.iter().cloned());
            (alias, Expr::and_chain(pushed))
        })
        .collect();

    let result = ClassificationResult {
        supported_by_table,
        residual,
    };
    tracing::debug!(
        pushed = result.pushed_count(),
        residual = result.residual.len(),
        "Classified predicates"
    );
    result
}

struct Classifier<'a> {
    capability: &'a CapabilityDescriptor,
    variant: &'a BackendVariant,
    aliases: Vec<&'a str>,
}

impl Classifier<'_> {
    /// Scope of a supported subtree, `None` when unsupported.
    fn scope_of(&self, expr: &Expr) -> Option<Scope> {
        if expr.contains_sub_select() {
            return None;
        }
        self.subtree_scope(expr, false)
    }

    fn subtree_scope(&self, expr: &Expr, under_or: bool) -> Option<Scope> {
        match expr {
            Expr::Binary { op, left, right } if op.is_logical() => {
                if !self.capability.supports_operator(*op) {
                    return None;
                }
                let under_or = under_or || *op == BinaryOp::Or;
                let left = self.subtree_scope(left, under_or)?;
                let right = self.subtree_scope(right, under_or)?;
                left.merge(right)
            }
            Expr::Literal(Literal::Bool(_)) => self
                .capability
                .supports_literal(LiteralKind::Bool)
                .then_some(Scope::Default),
            _ => self
                .function_scope(expr, under_or)
                .or_else(|| self.comparison_scope(expr)),
        }
    }

    fn function_scope(&self, expr: &Expr, under_or: bool) -> Option<Scope> {
        let found = self.capability.match_function(expr, self.variant)?;
        // Document stores reject a proximity operator nested in `$or`.
        if under_or
            && found.pattern == "distance"
            && self.capability.backend_kind == BackendKind::Document
        {
            return None;
        }
        self.column_scope(&found.column)
    }

    fn comparison_scope(&self, expr: &Expr) -> Option<Scope> {
        let cmp = expr.as_comparison()?;
        if !self.capability.supports_operator(cmp.op) {
            return None;
        }
        let kind = cmp.value.literal_kind()?;
        if !self.capability.supports_literal(kind) {
            return None;
        }
        let shape_ok = match cmp.op {
            BinaryOp::Is | BinaryOp::IsNot => kind == LiteralKind::Null,
            BinaryOp::In | BinaryOp::NotIn => {
                kind == LiteralKind::List && self.list_items_supported(cmp.value)
            }
            _ => !matches!(kind, LiteralKind::Null | LiteralKind::List),
        };
        if !shape_ok {
            return None;
        }
        self.column_scope(cmp.column)
    }

    fn list_items_supported(&self, value: &Expr) -> bool {
        let Expr::List(items) = value else {
            return false;
        };
        items.iter().all(|item| {
            item.literal_kind()
                .is_some_and(|k| k != LiteralKind::Null && self.capability.supports_literal(k))
        })
    }

    fn column_scope(&self, column: &ColumnRef) -> Option<Scope> {
        if CapabilityDescriptor::is_ambiguous_column(&column.column) {
            return None;
        }
        match &column.table {
            None => Some(Scope::Default),
            Some(table) if self.aliases.contains(&table.as_str()) => {
                Some(Scope::Table(table.clone()))
            }
            // Derived tables and outer-level aliases are not backend collections.
            Some(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::capability::patterns;
    use crate::query::JoinKind;
    use proptest::prelude::*;

    fn document_caps() -> CapabilityDescriptor {
        CapabilityDescriptor::new(BackendKind::Document)
            .with_literals(&[
                LiteralKind::Number,
                LiteralKind::String,
                LiteralKind::Bool,
                LiteralKind::Null,
                LiteralKind::List,
            ])
            .with_operators(&[
                (BinaryOp::And, "$and"),
                (BinaryOp::Or, "$or"),
                (BinaryOp::Eq, "$eq"),
                (BinaryOp::Lt, "$lt"),
                (BinaryOp::Gt, "$gt"),
                (BinaryOp::Is, "$eq"),
                (BinaryOp::In, "$in"),
            ])
            .with_functions(&[("distance", patterns::DISTANCE)])
    }

    fn collection(name: &str, join_kind: Option<JoinKind>) -> CollectionDescriptor {
        CollectionDescriptor {
            name: name.into(),
            alias: name.into(),
            join_kind,
            join_condition: None,
        }
    }

    fn eq(table: &str, column: &str, value: Expr) -> Expr {
        Expr::binary(BinaryOp::Eq, Expr::column(table, column), value)
    }

    fn run(selection: Option<Expr>, tables: &[CollectionDescriptor]) -> ClassificationResult {
        classify(
            selection.as_ref(),
            tables,
            &document_caps(),
            &BackendVariant::default(),
        )
    }

    #[test]
    fn empty_selection_pushes_true_everywhere() {
        let tables = [collection("a", None), collection("b", Some(JoinKind::Inner))];
        let result = run(None, &tables);
        assert!(result.residual.is_empty());
        assert!(result.supported_by_table["a"].is_true_literal());
        assert!(result.supported_by_table["b"].is_true_literal());
    }

    #[test]
    fn single_table_equality_is_pushed() {
        let result = run(
            Some(eq("parks", "city", Expr::string("X"))),
            &[collection("parks", None)],
        );
        assert!(result.residual.is_empty());
        assert_eq!(
            result.supported_by_table["parks"],
            eq("parks", "city", Expr::string("X"))
        );
    }

    #[test]
    fn cross_table_or_is_residual_in_either_order() {
        let tables = [collection("a", None), collection("b", Some(JoinKind::Inner))];
        let a = eq("a", "x", Expr::number(1));
        let b = eq("b", "y", Expr::number(2));
        for expr in [
            Expr::binary(BinaryOp::Or, a.clone(), b.clone()),
            Expr::binary(BinaryOp::Or, b.clone(), a.clone()),
        ] {
            let result = run(Some(expr.clone()), &tables);
            assert_eq!(result.residual, vec![expr]);
            assert_eq!(result.pushed_count(), 0);
        }
    }

    #[test]
    fn column_to_column_comparison_is_residual() {
        let tables = [collection("a", None), collection("b", Some(JoinKind::Inner))];
        let expr = Expr::binary(BinaryOp::Eq, Expr::column("a", "id"), Expr::column("b", "aid"));
        assert_eq!(run(Some(expr.clone()), &tables).residual, vec![expr]);
    }

    #[test]
    fn residual_keeps_source_order() {
        let tables = [collection("t", None)];
        let like1 = Expr::binary(BinaryOp::Like, Expr::column("t", "a"), Expr::string("x%"));
        let pushed = eq("t", "b", Expr::number(1));
        let like2 = Expr::binary(BinaryOp::Like, Expr::column("t", "c"), Expr::string("y%"));
        let selection = Expr::and_chain(vec![like1.clone(), pushed.clone(), like2.clone()]);
        let result = run(Some(selection), &tables);
        assert_eq!(result.residual, vec![like1, like2]);
        assert_eq!(result.supported_by_table["t"], pushed);
    }

    #[test]
    fn unsupported_operator_and_literal_are_residual() {
        let tables = [collection("t", None)];
        let not_eq = Expr::binary(BinaryOp::NotEq, Expr::column("t", "a"), Expr::number(1));
        assert_eq!(run(Some(not_eq.clone()), &tables).residual, vec![not_eq]);

        let eq_null = eq("t", "a", Expr::null());
        assert_eq!(run(Some(eq_null.clone()), &tables).residual, vec![eq_null]);

        let is_null = Expr::binary(BinaryOp::Is, Expr::column("t", "a"), Expr::null());
        assert!(run(Some(is_null), &tables).residual.is_empty());
    }

    #[test]
    fn ambiguous_columns_are_always_residual() {
        let tables = [collection("t", None)];
        let expr = eq("t", "_undef__name", Expr::string("x"));
        assert_eq!(run(Some(expr.clone()), &tables).residual, vec![expr]);
    }

    #[test]
    fn sub_selects_are_residual() {
        let tables = [collection("t", None)];
        let inner = crate::query::Select::wildcard(vec![crate::query::FromItem::table("u")]);
        let expr = Expr::binary(
            BinaryOp::In,
            Expr::column("t", "a"),
            Expr::SubSelect(Box::new(inner)),
        );
        assert_eq!(run(Some(expr.clone()), &tables).residual, vec![expr]);
    }

    #[test]
    fn distance_function_is_pushed() {
        let tables = [collection("parks", None)];
        let expr = Expr::binary(
            BinaryOp::LtEq,
            Expr::function(
                "ST_Distance",
                vec![
                    Expr::column("parks", "geometry"),
                    Expr::string("{\"type\":\"Point\",\"coordinates\":[0,0]}"),
                ],
            ),
            Expr::number(500),
        );
        let result = run(Some(expr.clone()), &tables);
        assert!(result.residual.is_empty());
        assert_eq!(result.supported_by_table["parks"], expr);
    }

    #[test]
    fn proximity_under_or_stays_local_for_document_stores() {
        let tables = [collection("parks", None)];
        let near = Expr::binary(
            BinaryOp::LtEq,
            Expr::function(
                "ST_Distance",
                vec![
                    Expr::column("parks", "geometry"),
                    Expr::string("{\"type\":\"Point\",\"coordinates\":[0,0]}"),
                ],
            ),
            Expr::number(500),
        );
        let nested = Expr::binary(
            BinaryOp::Or,
            eq("parks", "city", Expr::string("X")),
            Expr::binary(BinaryOp::And, near.clone(), eq("parks", "id", Expr::number(1))),
        );
        let result = run(Some(nested.clone()), &tables);
        assert_eq!(result.residual, vec![nested]);
        assert!(result.supported_by_table["parks"].is_true_literal());

        let xml_caps = CapabilityDescriptor {
            backend_kind: BackendKind::Xml,
            ..document_caps()
        };
        let either = Expr::binary(BinaryOp::Or, near, eq("parks", "city", Expr::string("X")));
        let result = classify(Some(&either), &tables, &xml_caps, &BackendVariant::default());
        assert!(result.residual.is_empty());
    }

    #[test]
    fn default_scope_conjuncts_are_shared() {
        let tables = [collection("a", None), collection("b", Some(JoinKind::Inner))];
        let result = run(Some(Expr::boolean(true)), &tables);
        assert!(result.supported_by_table["a"].is_true_literal());
        assert!(result.supported_by_table["b"].is_true_literal());
        assert!(result.residual.is_empty());
    }

    #[test]
    fn nullable_side_conjuncts_stay_local() {
        let tables = [collection("a", None), collection("b", Some(JoinKind::Left))];
        let on_b = eq("b", "kind", Expr::string("x"));
        let on_a = eq("a", "kind", Expr::string("y"));
        let result = run(Some(Expr::and_chain(vec![on_a.clone(), on_b.clone()])), &tables);
        assert!(result.supported_by_table["b"].is_true_literal());
        assert_eq!(result.supported_by_table["a"], on_a);
        assert_eq!(result.residual, vec![on_b]);
    }

    #[test]
    fn null_accepting_predicates_on_the_nullable_side_are_not_pushed() {
        let tables = [collection("a", None), collection("b", Some(JoinKind::Left))];
        let is_null = Expr::binary(BinaryOp::Is, Expr::column("b", "kind"), Expr::null());
        let result = run(Some(is_null.clone()), &tables);
        assert!(result.supported_by_table["b"].is_true_literal());
        assert_eq!(result.residual, vec![is_null]);
    }

    #[test]
    fn inner_joined_table_before_a_right_join_stays_local() {
        let tables = [
            collection("a", None),
            collection("b", Some(JoinKind::Inner)),
            collection("c", Some(JoinKind::Right)),
        ];
        let on_b = eq("b", "kind", Expr::string("x"));
        let on_c = eq("c", "kind", Expr::string("z"));
        let result = run(Some(Expr::and_chain(vec![on_b.clone(), on_c.clone()])), &tables);
        assert!(result.supported_by_table["b"].is_true_literal());
        assert_eq!(result.supported_by_table["c"], on_c);
        assert_eq!(result.residual, vec![on_b]);
    }

    #[test]
    fn unknown_alias_is_residual() {
        let tables = [collection("a", None)];
        let expr = eq("outer_t", "x", Expr::number(1));
        assert_eq!(run(Some(expr.clone()), &tables).residual, vec![expr]);
    }

    fn arb_leaf(table: &'static str) -> impl Strategy<Value = Expr> {
        (
            prop::sample::select(vec!["x", "y", "z"]),
            prop::sample::select(vec![BinaryOp::Eq, BinaryOp::Lt, BinaryOp::Gt]),
            any::<i64>(),
        )
            .prop_map(move |(column, op, n)| {
                Expr::binary(op, Expr::column(table, column), Expr::number(n))
            })
    }

    fn arb_tree(table: &'static str) -> impl Strategy<Value = Expr> {
        arb_leaf(table).prop_recursive(3, 12, 2, |inner| {
            (inner.clone(), inner, prop::bool::ANY).prop_map(|(l, r, and)| {
                Expr::binary(if and { BinaryOp::And } else { BinaryOp::Or }, l, r)
            })
        })
    }

    proptest! {
        #[test]
        fn single_table_predicates_are_pushed(expr in arb_tree("a")) {
            let tables = [collection("a", None), collection("b", Some(JoinKind::Inner))];
            let result = run(Some(expr.clone()), &tables);
            prop_assert!(result.residual.is_empty());
            prop_assert_eq!(
                result.supported_by_table["a"].conjuncts(),
                expr.conjuncts()
            );
            prop_assert!(result.supported_by_table["b"].is_true_literal());
        }

        #[test]
        fn two_table_disjunctions_are_residual(a in arb_tree("a"), b in arb_tree("b")) {
            let tables = [collection("a", None), collection("b", Some(JoinKind::Inner))];
            let expr = Expr::binary(BinaryOp::Or, a, b);
            let result = run(Some(expr.clone()), &tables);
            prop_assert_eq!(result.residual, vec![expr]);
        }
    }
}

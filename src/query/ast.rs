// SPDX-License-Identifier: BUSL-1.1

//! Typed query AST.
//!
//! The tree is immutable by convention: every pass (normalize, classify,
//! rebuild) consumes or borrows a tree and returns a new one. Column
//! references carry an optional table qualifier which the normalizer fills in.

use serde::{Deserialize, Serialize};

/// A SELECT statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub distinct: bool,
    pub columns: Vec<Column>,
    pub from: Vec<FromItem>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
}

impl Select {
    /// `SELECT * FROM <from>` with nothing else set.
    pub fn wildcard(from: Vec<FromItem>) -> Self {
        Self {
            distinct: false,
            columns: vec![Column::new(Expr::Wildcard { table: None })],
            from,
            selection: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Alias of the first FROM entry, used to qualify bare column references.
    pub fn default_table(&self) -> Option<&str> {
        self.from.first().and_then(|f| f.name())
    }

    /// Every alias introduced by this level's FROM list.
    pub fn aliases(&self) -> Vec<&str> {
        self.from.iter().filter_map(|f| f.name()).collect()
    }

    /// True when the projection is a bare `*`.
    pub fn is_wildcard(&self) -> bool {
        self.columns
            .iter()
            .any(|c| matches!(c.expr, Expr::Wildcard { table: None }))
    }

    /// Output names of explicitly aliased projection entries.
    pub fn projection_aliases(&self) -> Vec<&str> {
        self.columns.iter().filter_map(|c| c.alias.as_deref()).collect()
    }
}

/// A projection entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl Column {
    pub fn new(expr: Expr) -> Self {
        Self { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }
}

/// A FROM entry. The first entry of a FROM list never carries a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FromItem {
    pub source: TableSource,
    pub alias: Option<String>,
    pub join: Option<Join>,
}

impl FromItem {
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            source: TableSource::Table(name.into()),
            alias: None,
            join: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_join(mut self, kind: JoinKind, on: Option<Expr>) -> Self {
        self.join = Some(Join { kind, on });
        self
    }

    /// The name this entry is visible under: the alias, else the table name.
    pub fn name(&self) -> Option<&str> {
        match (&self.alias, &self.source) {
            (Some(alias), _) => Some(alias.as_str()),
            (None, TableSource::Table(name)) => Some(name.as_str()),
            (None, _) => None,
        }
    }

    pub fn join_kind(&self) -> Option<JoinKind> {
        self.join.as_ref().map(|j| j.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TableSource {
    Table(String),
    SubSelect(Box<Select>),
    Values(InlineTable),
}

/// `(VALUES (..), (..)) AS alias(columns..)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub kind: JoinKind,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl JoinKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL JOIN",
            JoinKind::Cross => "CROSS JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub expr: Expr,
    pub asc: Option<bool>,
}

/// A (possibly qualified) column reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: Option<String>, column: impl Into<String>) -> Self {
        Self {
            table,
            column: column.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(Some(table.into()), column)
    }
}

/// WHERE/projection expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Column(ColumnRef),
    Function {
        name: String,
        args: Vec<Expr>,
    },
    Literal(Literal),
    List(Vec<Expr>),
    SubSelect(Box<Select>),
    /// `*` or `t.*`, in projections and as the argument of `count(*)`.
    Wildcard {
        table: Option<String>,
    },
}

impl Expr {
    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column(ColumnRef::qualified(table, column))
    }

    pub fn bare_column(column: impl Into<String>) -> Self {
        Expr::Column(ColumnRef::new(None, column))
    }

    pub fn number(value: impl ToString) -> Self {
        Expr::Literal(Literal::Number(value.to_string()))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(Literal::String(value.into()))
    }

    pub fn boolean(value: bool) -> Self {
        Expr::Literal(Literal::Bool(value))
    }

    pub fn null() -> Self {
        Expr::Literal(Literal::Null)
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    pub fn is_true_literal(&self) -> bool {
        matches!(self, Expr::Literal(Literal::Bool(true)))
    }

    /// Right-nested AND chain: `a AND (b AND (c ..))`. Empty input is `true`.
    pub fn and_chain(mut predicates: Vec<Expr>) -> Expr {
        let Some(mut acc) = predicates.pop() else {
            return Expr::boolean(true);
        };
        while let Some(next) = predicates.pop() {
            acc = Expr::binary(BinaryOp::And, next, acc);
        }
        acc
    }

    /// Splits along top-level AND nodes. OR subtrees stay whole.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        collect_conjuncts(self, &mut out);
        out
    }

    /// Column references in this expression, not descending into sub-selects.
    pub fn column_refs(&self) -> Vec<&ColumnRef> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Column(c) = e {
                out.push(c);
            }
        });
        out
    }

    /// True if any node below (sub-selects excluded) satisfies `pred`.
    pub fn any(&self, pred: &mut dyn FnMut(&Expr) -> bool) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if !found && pred(e) {
                found = true;
            }
        });
        found
    }

    pub fn contains_sub_select(&self) -> bool {
        self.any(&mut |e| matches!(e, Expr::SubSelect(_)))
    }

    /// Pre-order walk. Sub-selects are visited as a node but not entered.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::Unary { expr, .. } => expr.visit(f),
            Expr::Function { args, .. } => args.iter().for_each(|a| a.visit(f)),
            Expr::List(values) => values.iter().for_each(|v| v.visit(f)),
            Expr::Column(_) | Expr::Literal(_) | Expr::SubSelect(_) | Expr::Wildcard { .. } => {}
        }
    }

    /// Post-order rewrite producing a new tree. Sub-selects are handed to `f`
    /// as a whole and never entered.
    pub fn transform(self, f: &mut dyn FnMut(Expr) -> Expr) -> Expr {
        let rebuilt = match self {
            Expr::Binary { op, left, right } => Expr::Binary {
                op,
                left: Box::new(left.transform(f)),
                right: Box::new(right.transform(f)),
            },
            Expr::Unary { op, expr } => Expr::Unary {
                op,
                expr: Box::new(expr.transform(f)),
            },
            Expr::Function { name, args } => Expr::Function {
                name,
                args: args.into_iter().map(|a| a.transform(f)).collect(),
            },
            Expr::List(values) => Expr::List(values.into_iter().map(|v| v.transform(f)).collect()),
            leaf => leaf,
        };
        f(rebuilt)
    }

    /// Views a binary comparison as `column <op> value`, flipping the operator
    /// when the column sits on the right.
    pub fn as_comparison(&self) -> Option<Comparison<'_>> {
        let Expr::Binary { op, left, right } = self else {
            return None;
        };
        if !op.is_comparison() {
            return None;
        }
        match (left.as_ref(), right.as_ref()) {
            (Expr::Column(column), value) if value.is_constant() => Some(Comparison {
                column,
                op: *op,
                value,
            }),
            (value, Expr::Column(column)) if value.is_constant() => {
                let op = op.flipped()?;
                Some(Comparison { column, op, value })
            }
            _ => None,
        }
    }

    /// Literal or list of literals.
    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Literal(_) => true,
            Expr::List(values) => values.iter().all(|v| matches!(v, Expr::Literal(_))),
            _ => false,
        }
    }

    /// Kind of a constant operand, if it is one.
    pub fn literal_kind(&self) -> Option<LiteralKind> {
        match self {
            Expr::Literal(lit) => Some(lit.kind()),
            Expr::List(values) if values.iter().all(|v| matches!(v, Expr::Literal(_))) => {
                Some(LiteralKind::List)
            }
            _ => None,
        }
    }
}

fn collect_conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            collect_conjuncts(left, out);
            collect_conjuncts(right, out);
        }
        other => out.push(other),
    }
}

/// `column <op> constant`, oriented with the column on the left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison<'a> {
    pub column: &'a ColumnRef,
    pub op: BinaryOp,
    pub value: &'a Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Literal {
    /// Kept as source text so rendering is lossless.
    Number(String),
    String(String),
    Bool(bool),
    Null,
}

impl Literal {
    pub fn kind(&self) -> LiteralKind {
        match self {
            Literal::Number(_) => LiteralKind::Number,
            Literal::String(_) => LiteralKind::String,
            Literal::Bool(_) => LiteralKind::Bool,
            Literal::Null => LiteralKind::Null,
        }
    }

    /// Best-effort JSON form, used when lowering into document filters.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Literal::Number(n) => n
                .parse::<i64>()
                .map(serde_json::Value::from)
                .or_else(|_| n.parse::<f64>().map(serde_json::Value::from))
                .unwrap_or_else(|_| serde_json::Value::String(n.clone())),
            Literal::String(s) => serde_json::Value::String(s.clone()),
            Literal::Bool(b) => serde_json::Value::Bool(*b),
            Literal::Null => serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiteralKind {
    Number,
    String,
    Bool,
    Null,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Is,
    IsNot,
    In,
    NotIn,
    Like,
    NotLike,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Concat,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Is => "IS",
            BinaryOp::IsNot => "IS NOT",
            BinaryOp::In => "IN",
            BinaryOp::NotIn => "NOT IN",
            BinaryOp::Like => "LIKE",
            BinaryOp::NotLike => "NOT LIKE",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Concat => "||",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
                | BinaryOp::Is
                | BinaryOp::IsNot
                | BinaryOp::In
                | BinaryOp::NotIn
                | BinaryOp::Like
                | BinaryOp::NotLike
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    /// The operator that keeps meaning when operands are swapped.
    pub fn flipped(&self) -> Option<BinaryOp> {
        match self {
            BinaryOp::Eq => Some(BinaryOp::Eq),
            BinaryOp::NotEq => Some(BinaryOp::NotEq),
            BinaryOp::Lt => Some(BinaryOp::Gt),
            BinaryOp::LtEq => Some(BinaryOp::GtEq),
            BinaryOp::Gt => Some(BinaryOp::Lt),
            BinaryOp::GtEq => Some(BinaryOp::LtEq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Minus,
    Exists,
    NotExists,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_chain_is_right_nested() {
        let chain = Expr::and_chain(vec![
            Expr::boolean(true),
            Expr::number(1),
            Expr::number(2),
        ]);
        let Expr::Binary { op, left, right } = chain else {
            panic!("expected AND node");
        };
        assert_eq!(op, BinaryOp::And);
        assert!(left.is_true_literal());
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::And, .. }));
    }

    #[test]
    fn empty_and_chain_is_true() {
        assert!(Expr::and_chain(vec![]).is_true_literal());
    }

    #[test]
    fn conjuncts_keep_or_subtrees() {
        let expr = Expr::binary(
            BinaryOp::And,
            Expr::binary(BinaryOp::Or, Expr::boolean(true), Expr::boolean(false)),
            Expr::binary(BinaryOp::Eq, Expr::column("t", "a"), Expr::number(1)),
        );
        let parts = expr.conjuncts();
        assert_eq!(parts.len(), 2);
        assert!(matches!(parts[0], Expr::Binary { op: BinaryOp::Or, .. }));
    }

    #[test]
    fn comparison_flips_when_literal_is_left() {
        let expr = Expr::binary(BinaryOp::Lt, Expr::number(5), Expr::column("t", "a"));
        let cmp = expr.as_comparison().unwrap();
        assert_eq!(cmp.op, BinaryOp::Gt);
        assert_eq!(cmp.column.column, "a");
    }

    #[test]
    fn column_vs_column_is_not_a_comparison() {
        let expr = Expr::binary(BinaryOp::Eq, Expr::column("a", "x"), Expr::column("b", "y"));
        assert!(expr.as_comparison().is_none());
    }

    #[test]
    fn column_refs_skip_sub_selects() {
        let inner = Select::wildcard(vec![FromItem::table("inner_t")]);
        let expr = Expr::binary(
            BinaryOp::In,
            Expr::column("t", "a"),
            Expr::SubSelect(Box::new(inner)),
        );
        assert_eq!(expr.column_refs().len(), 1);
        assert!(expr.contains_sub_select());
    }
}

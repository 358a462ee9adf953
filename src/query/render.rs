// SPDX-License-Identifier: BUSL-1.1

//! SQL text rendering for the relational engine.
//!
//! This is the only place where query text is produced from the AST, so all
//! identifier quoting and string escaping happens here.

use super::ast::{
    BinaryOp, Column, Expr, FromItem, InlineTable, Literal, OrderBy, Select, TableSource, UnaryOp,
};

/// Quotes an identifier, doubling embedded `"`.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal, doubling embedded `'`. Nothing else is altered.
pub fn quote_string(value: &str) -> String {
    format!("'{}'", double_quotes(value))
}

/// `O'Brien` -> `O''Brien`
pub fn double_quotes(value: &str) -> String {
    value.replace('\'', "''")
}

pub fn render_select(select: &Select) -> String {
    let mut sql = String::from("SELECT ");
    if select.distinct {
        sql.push_str("DISTINCT ");
    }

    let columns: Vec<String> = select.columns.iter().map(render_column).collect();
    sql.push_str(&columns.join(", "));

    if !select.from.is_empty() {
        sql.push_str(" FROM ");
        for (idx, item) in select.from.iter().enumerate() {
            if idx > 0 {
                match &item.join {
                    Some(join) => {
                        sql.push(' ');
                        sql.push_str(join.kind.keyword());
                        sql.push(' ');
                    }
                    None => sql.push_str(", "),
                }
            }
            sql.push_str(&render_from_item(item));
            if let Some(on) = item.join.as_ref().and_then(|j| j.on.as_ref()) {
                sql.push_str(" ON ");
                sql.push_str(&render_expr(on));
            }
        }
    }

    if let Some(selection) = &select.selection {
        sql.push_str(" WHERE ");
        sql.push_str(&render_expr(selection));
    }

    if !select.group_by.is_empty() {
        let groups: Vec<String> = select.group_by.iter().map(render_expr).collect();
        sql.push_str(" GROUP BY ");
        sql.push_str(&groups.join(", "));
    }

    if let Some(having) = &select.having {
        sql.push_str(" HAVING ");
        sql.push_str(&render_expr(having));
    }

    if !select.order_by.is_empty() {
        let orders: Vec<String> = select.order_by.iter().map(render_order_by).collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&orders.join(", "));
    }

    if let Some(limit) = select.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    sql
}

fn render_column(column: &Column) -> String {
    match &column.alias {
        Some(alias) => format!("{} AS {}", render_expr(&column.expr), quote_ident(alias)),
        None => render_expr(&column.expr),
    }
}

fn render_order_by(order: &OrderBy) -> String {
    match order.asc {
        Some(true) => format!("{} ASC", render_expr(&order.expr)),
        Some(false) => format!("{} DESC", render_expr(&order.expr)),
        None => render_expr(&order.expr),
    }
}

fn render_from_item(item: &FromItem) -> String {
    match &item.source {
        TableSource::Table(name) => match &item.alias {
            Some(alias) if alias != name => {
                format!("{} AS {}", quote_ident(name), quote_ident(alias))
            }
            _ => quote_ident(name),
        },
        TableSource::SubSelect(select) => {
            let alias = item.alias.as_deref().unwrap_or("subquery");
            format!("({}) AS {}", render_select(select), quote_ident(alias))
        }
        TableSource::Values(table) => {
            let alias = item.alias.as_deref().unwrap_or("inline_values");
            render_values(table, alias)
        }
    }
}

fn render_values(table: &InlineTable, alias: &str) -> String {
    let rows: Vec<String> = table
        .rows
        .iter()
        .map(|row| {
            let values: Vec<String> = row.iter().map(render_expr).collect();
            format!("({})", values.join(", "))
        })
        .collect();
    let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "(VALUES {}) AS {}({})",
        rows.join(", "),
        quote_ident(alias),
        columns.join(", ")
    )
}

pub fn render_expr(expr: &Expr) -> String {
    match expr {
        Expr::Binary { op, left, right } => {
            format!("{} {} {}", render_operand(left), op.symbol(), render_operand(right))
        }
        Expr::Unary { op, expr } => match op {
            UnaryOp::Not => format!("NOT {}", render_operand(expr)),
            UnaryOp::Minus => format!("-{}", render_operand(expr)),
            UnaryOp::Exists => format!("EXISTS {}", render_operand(expr)),
            UnaryOp::NotExists => format!("NOT EXISTS {}", render_operand(expr)),
        },
        Expr::Column(column) => match &column.table {
            Some(table) => format!("{}.{}", quote_ident(table), quote_ident(&column.column)),
            None => quote_ident(&column.column),
        },
        Expr::Function { name, args } => {
            let args: Vec<String> = args.iter().map(render_expr).collect();
            format!("{}({})", name, args.join(", "))
        }
        Expr::Literal(literal) => render_literal(literal),
        Expr::List(values) => {
            let values: Vec<String> = values.iter().map(render_expr).collect();
            format!("({})", values.join(", "))
        }
        Expr::SubSelect(select) => format!("({})", render_select(select)),
        Expr::Wildcard { table: Some(table) } => format!("{}.*", quote_ident(table)),
        Expr::Wildcard { table: None } => "*".to_string(),
    }
}

/// Binary children are parenthesized so operator precedence never depends on
/// the engine's grammar.
fn render_operand(expr: &Expr) -> String {
    match expr {
        Expr::Binary { .. } | Expr::Unary { .. } => format!("({})", render_expr(expr)),
        _ => render_expr(expr),
    }
}

pub fn render_literal(literal: &Literal) -> String {
    match literal {
        Literal::Number(n) => n.clone(),
        Literal::String(s) => quote_string(s),
        Literal::Bool(true) => "TRUE".to_string(),
        Literal::Bool(false) => "FALSE".to_string(),
        Literal::Null => "NULL".to_string(),
    }
}

impl std::fmt::Display for Select {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&render_select(self))
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&render_expr(self))
    }
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::JoinKind;

    #[test]
    fn quote_string_doubles_single_quotes_only() {
        assert_eq!(quote_string("O'Brien"), "'O''Brien'");
        assert_eq!(quote_string("a\"b"), "'a\"b'");
    }

    #[test]
    fn quote_ident_doubles_double_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn renders_join_with_condition() {
        let select = Select {
            from: vec![
                FromItem::table("parks").with_alias("p"),
                FromItem::table("cities").with_alias("c").with_join(
                    JoinKind::Left,
                    Some(Expr::binary(
                        BinaryOp::Eq,
                        Expr::column("p", "city_id"),
                        Expr::column("c", "id"),
                    )),
                ),
            ],
            ..Select::wildcard(vec![])
        };
        assert_eq!(
            render_select(&select),
            "SELECT * FROM \"parks\" AS \"p\" LEFT JOIN \"cities\" AS \"c\" ON \"p\".\"city_id\" = \"c\".\"id\""
        );
    }

    #[test]
    fn renders_inline_values_table() {
        let item = FromItem {
            source: TableSource::Values(InlineTable {
                columns: vec!["name".into(), "size".into()],
                rows: vec![vec![Expr::string("O'Brien"), Expr::number(3)]],
            }),
            alias: Some("parks".into()),
            join: None,
        };
        assert_eq!(
            render_from_item(&item),
            "(VALUES ('O''Brien', 3)) AS \"parks\"(\"name\", \"size\")"
        );
    }

    #[test]
    fn nested_binaries_are_parenthesized() {
        let expr = Expr::binary(
            BinaryOp::Or,
            Expr::binary(BinaryOp::Eq, Expr::column("t", "a"), Expr::number(1)),
            Expr::binary(BinaryOp::Is, Expr::column("t", "b"), Expr::null()),
        );
        assert_eq!(
            render_expr(&expr),
            "(\"t\".\"a\" = 1) OR (\"t\".\"b\" IS NULL)"
        );
    }
}

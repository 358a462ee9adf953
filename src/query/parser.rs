// SPDX-License-Identifier: BUSL-1.1

//! SQL text to query AST.
//!
//! Parsing is delegated to `sqlparser`; this module only lowers its tree into
//! the smaller AST the federation pipeline works on and rejects everything the
//! pipeline cannot represent.

use sqlparser::ast::{
    self as sql, BinaryOperator, Distinct, FunctionArg, FunctionArgExpr, FunctionArguments,
    GroupByExpr, JoinConstraint, JoinOperator, LimitClause, ObjectName, ObjectNamePart,
    OrderByKind, Query, SelectItem, SelectItemQualifiedWildcardKind, SetExpr, Statement,
    TableFactor, TableWithJoins, UnaryOperator, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::engine::error::{EngineError, EngineResult};

use super::ast::{
    BinaryOp, Column, Expr, FromItem, InlineTable, JoinKind, Literal, OrderBy, Select,
    TableSource, UnaryOp,
};

/// Parses a single SELECT statement.
pub fn parse_select(sql: &str) -> EngineResult<Select> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql.trim())
        .map_err(|e| EngineError::syntax_error(format!("Failed to parse query: {e}")))?;

    if statements.len() != 1 {
        return Err(EngineError::validation(
            "Federated queries must be a single statement",
        ));
    }

    match &statements[0] {
        Statement::Query(query) => lower_query(query),
        _ => Err(EngineError::validation(
            "Federated queries must be SELECT statements",
        )),
    }
}

fn part_value(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(ident) => ident.value.clone(),
        _ => String::new(),
    }
}

/// Last component of a possibly dotted name.
fn object_name(name: &ObjectName) -> String {
    name.0.last().map(part_value).unwrap_or_default()
}

fn lower_query(query: &Query) -> EngineResult<Select> {
    if query.with.is_some() {
        return Err(EngineError::not_supported("WITH clauses"));
    }

    let SetExpr::Select(body) = query.body.as_ref() else {
        return Err(EngineError::not_supported(
            "only plain SELECT bodies can be federated",
        ));
    };
    let mut select = lower_select(body)?;

    if let Some(order_by) = &query.order_by {
        if let OrderByKind::Expressions(exprs) = &order_by.kind {
            for item in exprs {
                select.order_by.push(OrderBy {
                    expr: lower_expr(&item.expr)?,
                    asc: item.options.asc,
                });
            }
        } else {
            return Err(EngineError::not_supported("ORDER BY ALL"));
        }
    }

    if let Some(limit_clause) = &query.limit_clause {
        select.limit = lower_limit(limit_clause)?;
    }

    Ok(select)
}

fn lower_limit(clause: &LimitClause) -> EngineResult<Option<u64>> {
    match clause {
        LimitClause::LimitOffset {
            limit,
            offset,
            limit_by,
        } => {
            if offset.is_some() || !limit_by.is_empty() {
                return Err(EngineError::not_supported("OFFSET and LIMIT BY"));
            }
            match limit {
                None => Ok(None),
                Some(sql::Expr::Value(value)) => match &value.value {
                    Value::Number(text, _) => text
                        .parse::<u64>()
                        .map(Some)
                        .map_err(|_| EngineError::validation("LIMIT must be a positive integer")),
                    _ => Err(EngineError::validation("LIMIT must be a numeric literal")),
                },
                Some(_) => Err(EngineError::validation("LIMIT must be a literal")),
            }
        }
        LimitClause::OffsetCommaLimit { .. } => {
            Err(EngineError::not_supported("LIMIT with comma offset"))
        }
    }
}

fn lower_select(select: &sql::Select) -> EngineResult<Select> {
    let distinct = match &select.distinct {
        None => false,
        Some(Distinct::Distinct) => true,
        Some(_) => return Err(EngineError::not_supported("DISTINCT ON")),
    };

    let mut columns = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        columns.push(match item {
            SelectItem::UnnamedExpr(expr) => Column::new(lower_expr(expr)?),
            SelectItem::ExprWithAlias { expr, alias } => {
                Column::aliased(lower_expr(expr)?, alias.value.clone())
            }
            SelectItem::Wildcard(_) => Column::new(Expr::Wildcard { table: None }),
            SelectItem::QualifiedWildcard(SelectItemQualifiedWildcardKind::ObjectName(name), _) => {
                Column::new(Expr::Wildcard {
                    table: Some(object_name(name)),
                })
            }
            SelectItem::QualifiedWildcard(..) => {
                return Err(EngineError::not_supported("expression wildcards"));
            }
        });
    }

    let mut from = Vec::new();
    for twj in &select.from {
        lower_table_with_joins(twj, &mut from)?;
    }

    let selection = select.selection.as_ref().map(lower_expr).transpose()?;

    let group_by = match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => {
            exprs.iter().map(lower_expr).collect::<EngineResult<Vec<_>>>()?
        }
        GroupByExpr::All(_) => return Err(EngineError::not_supported("GROUP BY ALL")),
    };

    let having = select.having.as_ref().map(lower_expr).transpose()?;

    Ok(Select {
        distinct,
        columns,
        from,
        selection,
        group_by,
        having,
        order_by: Vec::new(),
        limit: None,
    })
}

fn lower_table_with_joins(twj: &TableWithJoins, out: &mut Vec<FromItem>) -> EngineResult<()> {
    out.push(lower_table_factor(&twj.relation)?);

    for join in &twj.joins {
        let (kind, constraint) = match &join.join_operator {
            JoinOperator::Join(c) | JoinOperator::Inner(c) => (JoinKind::Inner, c),
            JoinOperator::Left(c) | JoinOperator::LeftOuter(c) => (JoinKind::Left, c),
            JoinOperator::Right(c) | JoinOperator::RightOuter(c) => (JoinKind::Right, c),
            JoinOperator::FullOuter(c) => (JoinKind::Full, c),
            JoinOperator::CrossJoin(c) => (JoinKind::Cross, c),
            other => {
                return Err(EngineError::not_supported(format!(
                    "join operator {other:?}"
                )));
            }
        };
        let on = match constraint {
            JoinConstraint::On(expr) => Some(lower_expr(expr)?),
            JoinConstraint::None => None,
            JoinConstraint::Using(_) | JoinConstraint::Natural => {
                return Err(EngineError::not_supported("USING and NATURAL joins"));
            }
        };
        out.push(lower_table_factor(&join.relation)?.with_join(kind, on));
    }
    Ok(())
}

fn lower_table_factor(factor: &TableFactor) -> EngineResult<FromItem> {
    match factor {
        TableFactor::Table { name, alias, .. } => Ok(FromItem {
            source: TableSource::Table(object_name(name)),
            alias: alias.as_ref().map(|a| a.name.value.clone()),
            join: None,
        }),
        TableFactor::Derived {
            subquery, alias, ..
        } => {
            let alias_name = alias.as_ref().map(|a| a.name.value.clone());
            if let SetExpr::Values(values) = subquery.body.as_ref() {
                let columns = alias
                    .as_ref()
                    .map(|a| a.columns.iter().map(|c| c.name.value.clone()).collect())
                    .unwrap_or_default();
                let rows = values
                    .rows
                    .iter()
                    .map(|row| row.iter().map(lower_expr).collect::<EngineResult<Vec<_>>>())
                    .collect::<EngineResult<Vec<_>>>()?;
                return Ok(FromItem {
                    source: TableSource::Values(InlineTable { columns, rows }),
                    alias: alias_name,
                    join: None,
                });
            }
            Ok(FromItem {
                source: TableSource::SubSelect(Box::new(lower_query(subquery)?)),
                alias: alias_name,
                join: None,
            })
        }
        _ => Err(EngineError::not_supported(format!(
            "table factor {factor}"
        ))),
    }
}

fn lower_binary_op(op: &BinaryOperator) -> EngineResult<BinaryOp> {
    Ok(match op {
        BinaryOperator::And => BinaryOp::And,
        BinaryOperator::Or => BinaryOp::Or,
        BinaryOperator::Eq => BinaryOp::Eq,
        BinaryOperator::NotEq => BinaryOp::NotEq,
        BinaryOperator::Lt => BinaryOp::Lt,
        BinaryOperator::LtEq => BinaryOp::LtEq,
        BinaryOperator::Gt => BinaryOp::Gt,
        BinaryOperator::GtEq => BinaryOp::GtEq,
        BinaryOperator::Plus => BinaryOp::Plus,
        BinaryOperator::Minus => BinaryOp::Minus,
        BinaryOperator::Multiply => BinaryOp::Multiply,
        BinaryOperator::Divide => BinaryOp::Divide,
        BinaryOperator::Modulo => BinaryOp::Modulo,
        BinaryOperator::StringConcat => BinaryOp::Concat,
        other => return Err(EngineError::not_supported(format!("operator {other}"))),
    })
}

fn lower_value(value: &Value) -> EngineResult<Literal> {
    Ok(match value {
        Value::Number(text, _) => Literal::Number(text.clone()),
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => Literal::String(s.clone()),
        Value::Boolean(b) => Literal::Bool(*b),
        Value::Null => Literal::Null,
        other => return Err(EngineError::not_supported(format!("literal {other}"))),
    })
}

fn lower_expr(expr: &sql::Expr) -> EngineResult<Expr> {
    Ok(match expr {
        sql::Expr::Identifier(ident) => Expr::bare_column(ident.value.clone()),
        sql::Expr::CompoundIdentifier(idents) => match idents.as_slice() {
            [.., table, column] => Expr::column(table.value.clone(), column.value.clone()),
            [column] => Expr::bare_column(column.value.clone()),
            [] => return Err(EngineError::syntax_error("empty identifier")),
        },
        sql::Expr::Value(value) => Expr::Literal(lower_value(&value.value)?),
        sql::Expr::Nested(inner) => lower_expr(inner)?,
        sql::Expr::BinaryOp { left, op, right } => {
            Expr::binary(lower_binary_op(op)?, lower_expr(left)?, lower_expr(right)?)
        }
        sql::Expr::UnaryOp { op, expr: inner } => match op {
            UnaryOperator::Not => Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(lower_expr(inner)?),
            },
            UnaryOperator::Plus => lower_expr(inner)?,
            UnaryOperator::Minus => match lower_expr(inner)? {
                Expr::Literal(Literal::Number(n)) => match n.strip_prefix('-') {
                    Some(positive) => Expr::number(positive),
                    None => Expr::number(format!("-{n}")),
                },
                other => Expr::Unary {
                    op: UnaryOp::Minus,
                    expr: Box::new(other),
                },
            },
            other => return Err(EngineError::not_supported(format!("unary operator {other}"))),
        },
        sql::Expr::IsNull(inner) => Expr::binary(BinaryOp::Is, lower_expr(inner)?, Expr::null()),
        sql::Expr::IsNotNull(inner) => {
            Expr::binary(BinaryOp::IsNot, lower_expr(inner)?, Expr::null())
        }
        sql::Expr::InList {
            expr: inner,
            list,
            negated,
        } => {
            let values = list.iter().map(lower_expr).collect::<EngineResult<Vec<_>>>()?;
            let op = if *negated { BinaryOp::NotIn } else { BinaryOp::In };
            Expr::binary(op, lower_expr(inner)?, Expr::List(values))
        }
        sql::Expr::InSubquery {
            expr: inner,
            subquery,
            negated,
        } => {
            let op = if *negated { BinaryOp::NotIn } else { BinaryOp::In };
            Expr::binary(
                op,
                lower_expr(inner)?,
                Expr::SubSelect(Box::new(lower_query(subquery)?)),
            )
        }
        sql::Expr::Exists { subquery, negated } => Expr::Unary {
            op: if *negated {
                UnaryOp::NotExists
            } else {
                UnaryOp::Exists
            },
            expr: Box::new(Expr::SubSelect(Box::new(lower_query(subquery)?))),
        },
        sql::Expr::Subquery(subquery) => Expr::SubSelect(Box::new(lower_query(subquery)?)),
        sql::Expr::Between {
            expr: inner,
            negated,
            low,
            high,
        } => {
            let target = lower_expr(inner)?;
            let range = Expr::binary(
                BinaryOp::And,
                Expr::binary(BinaryOp::GtEq, target.clone(), lower_expr(low)?),
                Expr::binary(BinaryOp::LtEq, target, lower_expr(high)?),
            );
            if *negated {
                Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(range),
                }
            } else {
                range
            }
        }
        sql::Expr::Like {
            negated,
            expr: inner,
            pattern,
            ..
        } => {
            let op = if *negated {
                BinaryOp::NotLike
            } else {
                BinaryOp::Like
            };
            Expr::binary(op, lower_expr(inner)?, lower_expr(pattern)?)
        }
        sql::Expr::Tuple(values) => {
            Expr::List(values.iter().map(lower_expr).collect::<EngineResult<Vec<_>>>()?)
        }
        sql::Expr::Function(func) => {
            let name = object_name(&func.name);
            let args = match &func.args {
                FunctionArguments::None => Vec::new(),
                FunctionArguments::List(list) => list
                    .args
                    .iter()
                    .map(lower_function_arg)
                    .collect::<EngineResult<Vec<_>>>()?,
                FunctionArguments::Subquery(_) => {
                    return Err(EngineError::not_supported("sub-query function arguments"));
                }
            };
            Expr::function(name, args)
        }
        other => return Err(EngineError::not_supported(format!("expression {other}"))),
    })
}

fn lower_function_arg(arg: &FunctionArg) -> EngineResult<Expr> {
    match arg {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => lower_expr(expr),
        FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => Ok(Expr::Wildcard { table: None }),
        FunctionArg::Unnamed(FunctionArgExpr::QualifiedWildcard(name)) => Ok(Expr::Wildcard {
            table: Some(object_name(name)),
        }),
        _ => Err(EngineError::not_supported("named function arguments")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_projection_join_and_where() {
        let select = parse_select(
            "SELECT p.name AS park, c.name FROM parks p LEFT JOIN cities c ON p.city = c.id WHERE p.area > 10",
        )
        .unwrap();
        assert_eq!(select.columns.len(), 2);
        assert_eq!(select.columns[0].alias.as_deref(), Some("park"));
        assert_eq!(select.from.len(), 2);
        assert_eq!(select.from[1].join_kind(), Some(JoinKind::Left));
        let cmp = select.selection.as_ref().unwrap().as_comparison().unwrap();
        assert_eq!(cmp.op, BinaryOp::Gt);
    }

    #[test]
    fn is_null_becomes_is_comparison() {
        let select = parse_select("SELECT * FROM t WHERE a IS NOT NULL").unwrap();
        assert!(matches!(
            select.selection,
            Some(Expr::Binary {
                op: BinaryOp::IsNot,
                ..
            })
        ));
    }

    #[test]
    fn negative_numbers_fold_into_literals() {
        let select = parse_select("SELECT * FROM t WHERE a = -3.5").unwrap();
        let cmp = select.selection.as_ref().unwrap().as_comparison().unwrap();
        assert_eq!(cmp.value, &Expr::number("-3.5"));
    }

    #[test]
    fn count_star_and_limit() {
        let select =
            parse_select("SELECT count(*) FROM t GROUP BY t.kind ORDER BY t.kind DESC LIMIT 5")
                .unwrap();
        assert_eq!(
            select.columns[0].expr,
            Expr::function("count", vec![Expr::Wildcard { table: None }])
        );
        assert_eq!(select.group_by.len(), 1);
        assert_eq!(select.order_by[0].asc, Some(false));
        assert_eq!(select.limit, Some(5));
    }

    #[test]
    fn in_sub_select_is_kept_as_sub_select() {
        let select = parse_select("SELECT * FROM a WHERE a.x IN (SELECT y FROM b)").unwrap();
        assert!(select.selection.unwrap().contains_sub_select());
    }

    #[test]
    fn rejects_mutation_and_multiple_statements() {
        assert!(parse_select("DELETE FROM t").is_err());
        assert!(parse_select("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn syntax_errors_are_reported() {
        let err = parse_select("SELEC * FROM").unwrap_err();
        assert!(matches!(err, EngineError::SyntaxError { .. }));
    }
}

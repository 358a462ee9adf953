// SPDX-License-Identifier: BUSL-1.1

//! Query representation shared by every federation stage.

pub mod ast;
pub mod parser;
pub mod render;

pub use ast::{
    BinaryOp, Column, ColumnRef, Comparison, Expr, FromItem, InlineTable, Join, JoinKind,
    Literal, LiteralKind, OrderBy, Select, TableSource, UnaryOp,
};
pub use parser::parse_select;
pub use render::{quote_ident, quote_string, render_expr, render_select};

// SPDX-License-Identifier: BUSL-1.1

//! Backend query compilers.
//!
//! One compiler per backend family. Both lower pushable predicates and
//! column sets into a typed intermediate form first and produce text or JSON
//! in a single render step at the end.

pub mod document;
pub mod xquery;

use serde::Serialize;

use crate::engine::error::EngineResult;
use crate::federation::types::{BackendVariant, ColumnSet, FetchRequest};
use crate::query::Expr;

pub use document::{DocumentCompiler, Filter, ProjectionStyle};
pub use xquery::{Location, XQueryCompiler, XQueryDialect};

/// A compiled backend query, ready for the driver to send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NativeQuery {
    /// Filter document plus projection (an object, or a field list)
    Document {
        collection: String,
        filter: serde_json::Value,
        projection: serde_json::Value,
    },
    XQuery(String),
}

impl NativeQuery {
    /// One-line form for log fields.
    pub fn summary(&self) -> String {
        match self {
            NativeQuery::Document {
                collection,
                filter,
                projection,
            } => format!("{collection}: filter={filter} projection={projection}"),
            NativeQuery::XQuery(text) => text.split_whitespace().collect::<Vec<_>>().join(" "),
        }
    }
}

/// Shared shape of the family compilers.
pub trait QueryCompiler {
    /// Typed filter form
    type Selection;
    /// Typed projection form
    type Projection;

    /// Lowers a pushable predicate. Anything that cannot be lowered becomes
    /// the family's match-everything fragment.
    fn build_selection(&self, predicate: &Expr, variant: &BackendVariant) -> Self::Selection;

    /// Lowers a column set. `ColumnSet::All` is the natural projection.
    fn build_projection(&self, columns: &ColumnSet, variant: &BackendVariant) -> Self::Projection;

    /// Compiles a whole fetch request.
    fn compile(&self, request: &FetchRequest) -> EngineResult<NativeQuery>;
}

// SPDX-License-Identifier: BUSL-1.1

//! Document-filter family compiler (MongoDB filters, CouchDB Mango selectors).
//!
//! Documents are GeoJSON features: attributes live under `properties`, the
//! spatial payload under `geometry`.

use serde_json::{json, Map, Value as Json};

use crate::engine::error::{EngineError, EngineResult};
use crate::federation::capability::{CapabilityDescriptor, FunctionMatch, GEOMETRY_COLUMN};
use crate::federation::compiler::{NativeQuery, QueryCompiler};
use crate::federation::types::{BackendVariant, ColumnSet, FetchRequest};
use crate::query::{BinaryOp, ColumnRef, Expr, Literal};

/// Degrees to meters, applied to distance bounds.
pub const DEGREES_TO_METERS: f64 = 111.32 * 1000.0;

/// Typed document filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document
    All,
    /// Matches no document
    Nothing,
    Logical {
        token: &'static str,
        children: Vec<Filter>,
    },
    Compare {
        path: String,
        token: &'static str,
        value: Json,
    },
    /// Field absent or null
    Missing(String),
    /// Field present and not null
    Present(String),
    Mod {
        path: String,
        divisor: Json,
        remainder: Json,
    },
    /// String field starting with `prefix`
    Prefix { path: String, prefix: String },
    Near {
        geometry: Json,
        min_meters: Option<f64>,
        max_meters: Option<f64>,
    },
    Geo {
        operator: &'static str,
        geometry: Json,
    },
}

impl Filter {
    pub fn render(&self) -> Json {
        match self {
            Filter::All => json!({}),
            Filter::Nothing => json!({"_id": {"$exists": false}}),
            Filter::Logical { token, children } => match children.as_slice() {
                [] => json!({}),
                [single] => single.render(),
                _ => {
                    let rendered: Vec<Json> = children.iter().map(Filter::render).collect();
                    single_key(token, Json::Array(rendered))
                }
            },
            Filter::Compare { path, token, value } => {
                single_key(path, single_key(token, value.clone()))
            }
            Filter::Missing(path) => json!({"$or": [
                single_key(path, json!({"$exists": false})),
                single_key(path, Json::Null),
            ]}),
            Filter::Present(path) => json!({"$and": [
                single_key(path, json!({"$exists": true})),
                single_key(path, json!({"$ne": null})),
            ]}),
            Filter::Mod {
                path,
                divisor,
                remainder,
            } => single_key(path, json!({"$mod": [divisor, remainder]})),
            Filter::Prefix { path, prefix } => {
                single_key(path, json!({"$regex": format!("^{}", regex::escape(prefix))}))
            }
            Filter::Near {
                geometry,
                min_meters,
                max_meters,
            } => {
                let mut near = Map::new();
                near.insert("$geometry".into(), geometry.clone());
                if let Some(max) = max_meters {
                    near.insert("$maxDistance".into(), json!(max));
                }
                if let Some(min) = min_meters {
                    near.insert("$minDistance".into(), json!(min));
                }
                single_key(GEOMETRY_COLUMN, json!({"$near": near}))
            }
            Filter::Geo { operator, geometry } => single_key(
                GEOMETRY_COLUMN,
                single_key(operator, json!({"$geometry": geometry})),
            ),
        }
    }
}

fn single_key(key: &str, value: Json) -> Json {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Json::Object(map)
}

/// Typed projection.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Natural,
    Fields(Vec<String>),
}

/// How the backend expects the projection to be spelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionStyle {
    /// MongoDB projection document
    Object,
    /// CouchDB `fields` array
    FieldList,
}

impl Projection {
    /// Natural projections render as `{}` (object) or `null` (field list,
    /// meaning "omit the key").
    pub fn render(&self, style: ProjectionStyle) -> Json {
        match (self, style) {
            (Projection::Natural, ProjectionStyle::Object) => json!({}),
            (Projection::Natural, ProjectionStyle::FieldList) => Json::Null,
            (Projection::Fields(fields), ProjectionStyle::Object) => {
                let mut map = Map::new();
                map.insert("_id".into(), json!(0));
                map.insert(GEOMETRY_COLUMN.into(), json!(1));
                for field in fields {
                    let path = field_path(field);
                    map.insert(path.clone(), json!({"$ifNull": [format!("${path}"), null]}));
                }
                Json::Object(map)
            }
            (Projection::Fields(fields), ProjectionStyle::FieldList) => {
                let mut list = vec![json!(GEOMETRY_COLUMN)];
                list.extend(fields.iter().map(|f| json!(field_path(f))));
                Json::Array(list)
            }
        }
    }
}

/// Document path of a column.
pub fn field_path(column: &str) -> String {
    if column == GEOMETRY_COLUMN {
        column.to_string()
    } else {
        format!("properties.{column}")
    }
}

pub struct DocumentCompiler<'a> {
    capability: &'a CapabilityDescriptor,
    style: ProjectionStyle,
}

impl<'a> DocumentCompiler<'a> {
    pub fn new(capability: &'a CapabilityDescriptor, style: ProjectionStyle) -> Self {
        Self { capability, style }
    }

    fn lower(&self, expr: &Expr, variant: &BackendVariant) -> Filter {
        match expr {
            Expr::Literal(Literal::Bool(true)) => Filter::All,
            Expr::Literal(Literal::Bool(false)) => Filter::Nothing,
            Expr::Binary { op, left, right } if op.is_logical() => {
                let Some(token) = self.capability.translate(*op) else {
                    return Filter::All;
                };
                let mut children = Vec::new();
                for side in [left, right] {
                    match self.lower(side, variant) {
                        Filter::Logical {
                            token: inner,
                            children: nested,
                        } if inner == token => children.extend(nested),
                        lowered => children.push(lowered),
                    }
                }
                if *op == BinaryOp::And {
                    children.retain(|c| *c != Filter::All);
                }
                Filter::Logical { token, children }
            }
            _ => {
                if let Some(found) = self.capability.match_function(expr, variant) {
                    return self.lower_function(&found);
                }
                match expr.as_comparison() {
                    Some(cmp) => self.lower_comparison(cmp.column, cmp.op, cmp.value),
                    None => {
                        tracing::warn!(predicate = %expr, "Predicate cannot be lowered to a document filter");
                        Filter::All
                    }
                }
            }
        }
    }

    fn lower_comparison(&self, column: &ColumnRef, op: BinaryOp, value: &Expr) -> Filter {
        let path = field_path(&column.column);
        match (op, value) {
            (BinaryOp::Is, Expr::Literal(Literal::Null)) => Filter::Missing(path),
            (BinaryOp::IsNot, Expr::Literal(Literal::Null)) => Filter::Present(path),
            (_, value) => {
                let Some(token) = self.capability.translate(op) else {
                    return Filter::All;
                };
                let value = match value {
                    Expr::Literal(lit) => lit.to_json(),
                    Expr::List(items) => Json::Array(
                        items
                            .iter()
                            .filter_map(|item| match item {
                                Expr::Literal(lit) => Some(lit.to_json()),
                                _ => None,
                            })
                            .collect(),
                    ),
                    _ => return Filter::All,
                };
                let compare = Filter::Compare {
                    path: path.clone(),
                    token,
                    value,
                };
                // `$nin` alone also matches absent and null fields, which
                // SQL NOT IN never does.
                if op == BinaryOp::NotIn {
                    Filter::Logical {
                        token: "$and",
                        children: vec![Filter::Present(path), compare],
                    }
                } else {
                    compare
                }
            }
        }
    }

    /// Lowers a matched function predicate, keyed by pattern name.
    fn lower_function(&self, found: &FunctionMatch) -> Filter {
        let path = field_path(&found.column.column);
        let lowered = match found.pattern {
            "mod" => match (found.constant(0), found.constant(1)) {
                (Some(divisor), Some(remainder)) => Some(Filter::Mod {
                    path,
                    divisor: divisor.to_json(),
                    remainder: remainder.to_json(),
                }),
                _ => None,
            },
            "date" => found.text(0).and_then(|date| match found.op {
                Some(BinaryOp::Eq) => Some(Filter::Prefix {
                    path,
                    prefix: date.to_string(),
                }),
                Some(BinaryOp::Lt) => Some(Filter::Compare {
                    path,
                    token: "$lt",
                    value: json!(date),
                }),
                _ => None,
            }),
            "distance" => {
                let geometry = found.text(0).and_then(parse_geojson);
                let meters = found.number(1).map(|d| d * DEGREES_TO_METERS);
                match (geometry, meters, found.op) {
                    (Some(geometry), Some(m), Some(BinaryOp::LtEq)) => Some(Filter::Near {
                        geometry,
                        min_meters: None,
                        max_meters: Some(m),
                    }),
                    (Some(geometry), Some(m), Some(BinaryOp::GtEq)) => Some(Filter::Near {
                        geometry,
                        min_meters: Some(m),
                        max_meters: None,
                    }),
                    (Some(geometry), Some(m), Some(BinaryOp::Eq)) => Some(Filter::Near {
                        geometry,
                        min_meters: Some(m),
                        max_meters: Some(m),
                    }),
                    _ => None,
                }
            }
            "within" => found.text(0).and_then(parse_geojson).map(|geometry| Filter::Geo {
                operator: "$geoWithin",
                geometry,
            }),
            "intersects" => found.text(0).and_then(parse_geojson).map(|geometry| Filter::Geo {
                operator: "$geoIntersects",
                geometry,
            }),
            _ => None,
        };
        lowered.unwrap_or_else(|| {
            tracing::warn!(pattern = found.pattern, "Function predicate cannot be lowered");
            Filter::All
        })
    }
}

/// Parses a GeoJSON geometry literal.
pub fn parse_geojson(text: &str) -> Option<Json> {
    let value: Json = serde_json::from_str(text).ok()?;
    value.get("type")?.as_str()?;
    Some(value)
}

/// Accepts matches whose first constant is a GeoJSON geometry.
pub fn has_geojson_literal(found: &FunctionMatch) -> bool {
    found.text(0).and_then(parse_geojson).is_some()
}

impl QueryCompiler for DocumentCompiler<'_> {
    type Selection = Filter;
    type Projection = Projection;

    fn build_selection(&self, predicate: &Expr, variant: &BackendVariant) -> Filter {
        self.lower(predicate, variant)
    }

    fn build_projection(&self, columns: &ColumnSet, _variant: &BackendVariant) -> Projection {
        match columns {
            ColumnSet::All => Projection::Natural,
            ColumnSet::Named(names) => Projection::Fields(
                names
                    .iter()
                    .filter(|n| n.as_str() != GEOMETRY_COLUMN)
                    .cloned()
                    .collect(),
            ),
        }
    }

    fn compile(&self, request: &FetchRequest) -> EngineResult<NativeQuery> {
        if request.is_join() {
            return Err(EngineError::not_supported(
                "document backends do not execute joins",
            ));
        }
        if !request.aggregates.is_empty() || !request.group_by.is_empty() {
            return Err(EngineError::not_supported(
                "document backends do not execute grouping",
            ));
        }
        let scan = request
            .scans
            .first()
            .ok_or_else(|| EngineError::internal("fetch request without collections"))?;

        let filter = self.build_selection(&scan.predicate, &request.variant).render();
        let projection = self
            .build_projection(&scan.columns, &request.variant)
            .render(self.style);
        Ok(NativeQuery::Document {
            collection: scan.collection.name.clone(),
            filter,
            projection,
        })
    }
}

// SPDX-License-Identifier: BUSL-1.1

//! XML/XQuery family compiler (BaseX, eXist-db).
//!
//! Features are `gml:featureMember/*` children (GML) or `kml:Placemark`
//! elements (KML). Every feature that passes the filter is returned as one
//! `<result>` element holding one child element per output column.
//!
//! Column names address XML locations:
//!
//! | column                 | location                                  |
//! |------------------------|-------------------------------------------|
//! | `geometry`             | the feature's geometry element            |
//! | `_attribute__a`        | attribute `a` of the feature              |
//! | `_attribute__e__a`     | attribute `a` of child `e`                |
//! | `_attribute__p__c__a`  | attribute `a` of `c` nested under `p`     |
//! | `_undef__x`            | element or attribute `x`                  |
//! | `p__c`                 | element `c` nested under `p`              |
//! | anything else          | child element (GML), `ExtendedData` (KML) |

use crate::engine::error::{EngineError, EngineResult};
use crate::federation::capability::{CapabilityDescriptor, FunctionMatch, GEOMETRY_COLUMN};
use crate::federation::compiler::{NativeQuery, QueryCompiler};
use crate::federation::types::{
    joined_column_name, Aggregate, BackendVariant, CollectionScan, ColumnSet, FetchRequest,
    SpatialFlavor, SpatialNamespace,
};
use crate::query::{BinaryOp, ColumnRef, Expr, JoinKind, Literal};

pub const GEO_MODULE_URI: &str = "http://expath.org/ns/geo";

/// XQuery string literal: `'` doubled, `&` escaped.
pub fn xq_string(value: &str) -> String {
    format!("'{}'", value.replace('&', "&amp;").replace('\'', "''"))
}

/// How a store addresses a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// BaseX 7.x to 9.x
    DbOpen,
    /// BaseX 10 and later
    DbGet,
    /// eXist-db
    Collection,
}

/// Store-specific parts of the generated XQuery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XQueryDialect {
    pub source: SourceKind,
    pub database: String,
    /// Import the EXPath geo module and emit geometries as WKT
    pub geo_module: bool,
}

impl XQueryDialect {
    pub fn source_expr(&self, collection: &str) -> String {
        match self.source {
            SourceKind::DbOpen => format!(
                "db:open({}, {})",
                xq_string(&self.database),
                xq_string(collection)
            ),
            SourceKind::DbGet => format!(
                "db:get({}, {})",
                xq_string(&self.database),
                xq_string(collection)
            ),
            SourceKind::Collection => format!(
                "collection({})",
                xq_string(&format!("/db/{}/{}", self.database, collection))
            ),
        }
    }
}

/// An XML location relative to a feature node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Geometry,
    Element(String),
    Nested { parent: String, child: String },
    Attribute(String),
    ElementAttribute { element: String, attribute: String },
    NestedAttribute {
        parent: String,
        child: String,
        attribute: String,
    },
    /// Element or attribute, unknown which
    Ambiguous(String),
}

impl Location {
    pub fn from_column(name: &str) -> Self {
        if name == GEOMETRY_COLUMN {
            return Location::Geometry;
        }
        if let Some(rest) = name.strip_prefix("_attribute__") {
            let parts: Vec<&str> = rest.split("__").collect();
            return match parts.as_slice() {
                [attribute] => Location::Attribute(attribute.to_string()),
                [element, attribute] => Location::ElementAttribute {
                    element: element.to_string(),
                    attribute: attribute.to_string(),
                },
                [parent, child, attribute] => Location::NestedAttribute {
                    parent: parent.to_string(),
                    child: child.to_string(),
                    attribute: attribute.to_string(),
                },
                _ => Location::Element(name.to_string()),
            };
        }
        if let Some(rest) = name.strip_prefix("_undef__") {
            return Location::Ambiguous(rest.to_string());
        }
        match name.split_once("__") {
            Some((parent, child)) if !parent.is_empty() && !child.is_empty() => {
                Location::Nested {
                    parent: parent.to_string(),
                    child: child.to_string(),
                }
            }
            _ => Location::Element(name.to_string()),
        }
    }

    /// Path expression evaluated from `context` (e.g. `$f` or `.`).
    pub fn render(&self, context: &str, flavor: SpatialFlavor) -> String {
        match self {
            Location::Geometry => geometry_path(context, flavor),
            Location::Element(name) => match flavor {
                SpatialFlavor::Gml => format!("{context}/{}", child(name)),
                SpatialFlavor::Kml => format!(
                    "{context}/*:ExtendedData/*/*[@name = {}]",
                    xq_string(name)
                ),
            },
            Location::Nested { parent, child: leaf } => {
                format!("{context}/{}/*/{}", child(parent), child(leaf))
            }
            Location::Attribute(attribute) => format!("{context}/{}", attr(attribute)),
            Location::ElementAttribute { element, attribute } => {
                format!("{context}/{}/{}", child(element), attr(attribute))
            }
            Location::NestedAttribute {
                parent,
                child: leaf,
                attribute,
            } => format!(
                "{context}/{}/*/{}/{}",
                child(parent),
                child(leaf),
                attr(attribute)
            ),
            Location::Ambiguous(name) => format!(
                "({} | {context}/{})",
                Location::Element(name.clone()).render(context, flavor),
                attr(name)
            ),
        }
    }
}

fn child(name: &str) -> String {
    format!("*[local-name() = {}]", xq_string(name))
}

fn attr(name: &str) -> String {
    format!("@*[local-name() = {}]", xq_string(name))
}

fn spatial_type_list(flavor: SpatialFlavor) -> String {
    let names: Vec<String> = flavor.spatial_types().iter().map(|t| xq_string(t)).collect();
    format!("({})", names.join(", "))
}

fn geometry_path(context: &str, flavor: SpatialFlavor) -> String {
    match flavor {
        SpatialFlavor::Gml => format!(
            "{context}/*/*[local-name() = {}]",
            spatial_type_list(flavor)
        ),
        SpatialFlavor::Kml => format!("{context}/*[local-name() = {}]", spatial_type_list(flavor)),
    }
}

fn feature_path(flavor: SpatialFlavor) -> &'static str {
    match flavor {
        SpatialFlavor::Gml => "//gml:featureMember/*",
        SpatialFlavor::Kml => "//kml:Placemark",
    }
}

/// A constant operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Number(String),
    String(String),
}

impl Atom {
    fn from_literal(literal: &Literal) -> Option<Self> {
        match literal {
            Literal::Number(n) if n.parse::<f64>().is_ok() => Some(Atom::Number(n.clone())),
            Literal::Number(n) => Some(Atom::String(n.clone())),
            Literal::String(s) => Some(Atom::String(s.clone())),
            Literal::Bool(_) | Literal::Null => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Atom::Number(n) => n.clone(),
            Atom::String(s) => xq_string(s),
        }
    }

    fn is_number(&self) -> bool {
        matches!(self, Atom::Number(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoFunction {
    Distance,
    Within,
    Intersects,
    Dimension,
    Srid,
    GeometryType,
}

/// Typed XQuery filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    True,
    False,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Compare {
        location: Location,
        op: &'static str,
        value: Atom,
    },
    Membership {
        location: Location,
        values: Vec<Atom>,
        negated: bool,
    },
    Null {
        location: Location,
        negated: bool,
    },
    Mod {
        location: Location,
        divisor: Atom,
        op: &'static str,
        remainder: Atom,
    },
    Date {
        location: Location,
        op: &'static str,
        value: Atom,
    },
    Spatial {
        function: GeoFunction,
        /// Serialized geometry literal, parsed in the query
        literal: Option<String>,
        op: Option<&'static str>,
        value: Option<Atom>,
    },
}

impl Predicate {
    /// Renders against feature variable `context`.
    pub fn render(&self, context: &str, namespace: &SpatialNamespace) -> String {
        let flavor = namespace.flavor;
        match self {
            Predicate::True => "true()".to_string(),
            Predicate::False => "false()".to_string(),
            Predicate::And(children) => join_children(children, " and ", context, namespace),
            Predicate::Or(children) => join_children(children, " or ", context, namespace),
            Predicate::Compare {
                location,
                op,
                value,
            } => {
                let path = location.render(context, flavor);
                if value.is_number() {
                    format!("exists({path}[number(.) {op} {}])", value.render())
                } else {
                    format!("{path} {op} {}", value.render())
                }
            }
            Predicate::Membership {
                location,
                values,
                negated,
            } => {
                let path = location.render(context, flavor);
                let list: Vec<String> = values.iter().map(Atom::render).collect();
                let list = format!("({})", list.join(", "));
                let test = if values.iter().all(Atom::is_number) {
                    format!("exists({path}[number(.) = {list}])")
                } else {
                    format!("{path} = {list}")
                };
                if *negated {
                    format!("exists({path}) and not({test})")
                } else {
                    test
                }
            }
            Predicate::Null { location, negated } => {
                let path = location.render(context, flavor);
                let func = if *negated { "exists" } else { "empty" };
                format!("{func}({path}[. != ''])")
            }
            Predicate::Mod {
                location,
                divisor,
                op,
                remainder,
            } => format!(
                "exists({}[number(.) mod {} {op} {}])",
                location.render(context, flavor),
                divisor.render(),
                remainder.render()
            ),
            Predicate::Date {
                location,
                op,
                value,
            } => format!(
                "exists({}[substring(string(.), 1, 10) {op} {}])",
                location.render(context, flavor),
                value.render()
            ),
            Predicate::Spatial {
                function,
                literal,
                op,
                value,
            } => {
                let geometry = format!("({})[1]", geometry_path(context, flavor));
                let literal = literal
                    .as_deref()
                    .map(|text| geometry_literal(text, namespace))
                    .unwrap_or_default();
                let call = match function {
                    GeoFunction::Distance => format!("geo:distance({geometry}, {literal})"),
                    GeoFunction::Within => format!("geo:within({geometry}, {literal})"),
                    GeoFunction::Intersects => format!("geo:intersects({geometry}, {literal})"),
                    GeoFunction::Dimension => format!("geo:dimension({geometry})"),
                    GeoFunction::Srid => format!("geo:srid({geometry})"),
                    GeoFunction::GeometryType => {
                        format!("local-name-from-QName(geo:geometry-type({geometry}))")
                    }
                };
                let test = match (op, value) {
                    (Some(op), Some(value)) => format!("{call} {op} {}", value.render()),
                    _ => call,
                };
                format!("(if (exists({geometry})) then {test} else false())")
            }
        }
    }
}

fn join_children(
    children: &[Predicate],
    separator: &str,
    context: &str,
    namespace: &SpatialNamespace,
) -> String {
    match children {
        [] => "true()".to_string(),
        [single] => single.render(context, namespace),
        _ => children
            .iter()
            .map(|c| format!("({})", c.render(context, namespace)))
            .collect::<Vec<_>>()
            .join(separator),
    }
}

/// Wraps a geometry fragment so its namespace prefix resolves.
fn geometry_literal(text: &str, namespace: &SpatialNamespace) -> String {
    let wrapped = format!(
        "<geofed xmlns:{}=\"{}\">{}</geofed>",
        namespace.flavor.prefix(),
        namespace.uri,
        text
    );
    format!("parse-xml({})/*/*", xq_string(&wrapped))
}

/// One output element of a `<result>`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionItem {
    Column { name: String, location: Location },
    Geometry { name: String },
    /// Empty element, for the unmatched side of an outer join
    Empty { name: String },
}

/// Typed projection of one feature variable.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionPlan {
    /// Every child, attribute and the geometry; names get `prefix` prepended
    Natural { prefix: String },
    Items(Vec<ProjectionItem>),
}

pub struct XQueryCompiler<'a> {
    capability: &'a CapabilityDescriptor,
    dialect: XQueryDialect,
}

impl<'a> XQueryCompiler<'a> {
    pub fn new(capability: &'a CapabilityDescriptor, dialect: XQueryDialect) -> Self {
        Self {
            capability,
            dialect,
        }
    }

    fn lower(&self, expr: &Expr, variant: &BackendVariant) -> Predicate {
        match expr {
            Expr::Literal(Literal::Bool(true)) => Predicate::True,
            Expr::Literal(Literal::Bool(false)) => Predicate::False,
            Expr::Binary { op, left, right } if op.is_logical() => {
                let mut children = Vec::new();
                for side in [left, right] {
                    match (self.lower(side, variant), op) {
                        (Predicate::And(nested), BinaryOp::And)
                        | (Predicate::Or(nested), BinaryOp::Or) => children.extend(nested),
                        (Predicate::True, BinaryOp::And) => {}
                        (lowered, _) => children.push(lowered),
                    }
                }
                if *op == BinaryOp::And {
                    Predicate::And(children)
                } else {
                    Predicate::Or(children)
                }
            }
            _ => {
                if let Some(found) = self.capability.match_function(expr, variant) {
                    return self.lower_function(&found);
                }
                expr.as_comparison()
                    .and_then(|cmp| self.lower_comparison(cmp.column, cmp.op, cmp.value))
                    .unwrap_or_else(|| {
                        tracing::warn!(predicate = %expr, "Predicate cannot be lowered to XQuery");
                        Predicate::True
                    })
            }
        }
    }

    fn lower_comparison(&self, column: &ColumnRef, op: BinaryOp, value: &Expr) -> Option<Predicate> {
        let location = Location::from_column(&column.column);
        self.capability.translate(op)?;
        match (op, value) {
            (BinaryOp::Is, Expr::Literal(Literal::Null)) => Some(Predicate::Null {
                location,
                negated: false,
            }),
            (BinaryOp::IsNot, Expr::Literal(Literal::Null)) => Some(Predicate::Null {
                location,
                negated: true,
            }),
            (BinaryOp::In | BinaryOp::NotIn, Expr::List(items)) => {
                let values = items
                    .iter()
                    .map(|item| match item {
                        Expr::Literal(lit) => Atom::from_literal(lit),
                        _ => None,
                    })
                    .collect::<Option<Vec<_>>>()?;
                Some(Predicate::Membership {
                    location,
                    values,
                    negated: op == BinaryOp::NotIn,
                })
            }
            (_, Expr::Literal(lit)) => Some(Predicate::Compare {
                location,
                op: comparison_token(op)?,
                value: Atom::from_literal(lit)?,
            }),
            _ => None,
        }
    }

    fn lower_function(&self, found: &FunctionMatch) -> Predicate {
        let location = Location::from_column(&found.column.column);
        let op = found.op.and_then(comparison_token);
        let atom = |i: usize| found.constant(i).and_then(Atom::from_literal);
        let lowered = match found.pattern {
            "mod" => match (atom(0), op, atom(1)) {
                (Some(divisor), Some(op), Some(remainder)) => Some(Predicate::Mod {
                    location,
                    divisor,
                    op,
                    remainder,
                }),
                _ => None,
            },
            "date" => match (op, atom(0)) {
                (Some(op), Some(value)) => Some(Predicate::Date {
                    location,
                    op,
                    value,
                }),
                _ => None,
            },
            "distance" => Some(Predicate::Spatial {
                function: GeoFunction::Distance,
                literal: found.text(0).map(str::to_string),
                op,
                value: atom(1),
            }),
            "within" | "intersects" => Some(Predicate::Spatial {
                function: if found.pattern == "within" {
                    GeoFunction::Within
                } else {
                    GeoFunction::Intersects
                },
                literal: found.text(0).map(str::to_string),
                op: None,
                value: None,
            }),
            "dimension" | "srid" => Some(Predicate::Spatial {
                function: if found.pattern == "dimension" {
                    GeoFunction::Dimension
                } else {
                    GeoFunction::Srid
                },
                literal: None,
                op,
                value: atom(0),
            }),
            "geometry_type" => found.text(0).map(|name| Predicate::Spatial {
                function: GeoFunction::GeometryType,
                literal: None,
                op,
                value: Some(Atom::String(
                    name.strip_prefix("ST_").unwrap_or(name).to_string(),
                )),
            }),
            _ => None,
        };
        lowered.unwrap_or_else(|| {
            tracing::warn!(pattern = found.pattern, "Function predicate cannot be lowered to XQuery");
            Predicate::True
        })
    }

    fn namespace<'v>(&self, variant: &'v BackendVariant) -> EngineResult<&'v SpatialNamespace> {
        variant.namespace.as_ref().ok_or_else(|| {
            EngineError::internal("XQuery compilation requires a probed spatial namespace")
        })
    }

    fn prolog(&self, namespace: &SpatialNamespace) -> String {
        let mut prolog = format!(
            "declare namespace {} = {};\n",
            namespace.flavor.prefix(),
            xq_string(&namespace.uri)
        );
        if self.uses_geo_module(namespace) {
            prolog.push_str(&format!(
                "import module namespace geo = {};\n",
                xq_string(GEO_MODULE_URI)
            ));
        }
        prolog
    }

    fn uses_geo_module(&self, namespace: &SpatialNamespace) -> bool {
        self.dialect.geo_module && namespace.flavor == SpatialFlavor::Gml
    }

    fn features(&self, collection: &str, flavor: SpatialFlavor) -> String {
        format!("{}{}", self.dialect.source_expr(collection), feature_path(flavor))
    }

    fn geometry_text(&self, context: &str, namespace: &SpatialNamespace) -> String {
        let geometry = format!("({})[1]", geometry_path(context, namespace.flavor));
        if self.uses_geo_module(namespace) {
            format!("if (exists({geometry})) then geo:as-text({geometry}) else ()")
        } else {
            format!("if (exists({geometry})) then serialize({geometry}) else ()")
        }
    }

    fn render_projection(
        &self,
        plan: &ProjectionPlan,
        context: &str,
        namespace: &SpatialNamespace,
    ) -> Vec<String> {
        let flavor = namespace.flavor;
        match plan {
            ProjectionPlan::Natural { prefix } => {
                let prefix = xq_string(prefix);
                let children = match flavor {
                    SpatialFlavor::Gml => format!(
                        "for $c in {context}/*[empty(*/*[local-name() = {}])] return element {{concat({prefix}, local-name($c))}} {{string($c)}}",
                        spatial_type_list(flavor)
                    ),
                    SpatialFlavor::Kml => format!(
                        "for $d in {context}/*:ExtendedData/*/*[@name] return element {{concat({prefix}, string($d/@name))}} {{string($d)}}, \
                         for $c in {context}/*[empty(*)] return element {{concat({prefix}, local-name($c))}} {{string($c)}}"
                    ),
                };
                vec![
                    children,
                    format!(
                        "for $a in {context}/@* return element {{concat({prefix}, '_attribute__', local-name($a))}} {{string($a)}}"
                    ),
                    format!(
                        "element {{concat({prefix}, {})}} {{{}}}",
                        xq_string(GEOMETRY_COLUMN),
                        self.geometry_text(context, namespace)
                    ),
                ]
            }
            ProjectionPlan::Items(items) => items
                .iter()
                .map(|item| match item {
                    ProjectionItem::Column { name, location } => format!(
                        "element {{{}}} {{string(({})[1])}}",
                        xq_string(name),
                        location.render(context, flavor)
                    ),
                    ProjectionItem::Geometry { name } => format!(
                        "element {{{}}} {{{}}}",
                        xq_string(name),
                        self.geometry_text(context, namespace)
                    ),
                    ProjectionItem::Empty { name } => {
                        format!("element {{{}}} {{()}}", xq_string(name))
                    }
                })
                .collect(),
        }
    }

    /// Projection of one side, with output names taken from `name_of`.
    fn side_projection(
        &self,
        scan: &CollectionScan,
        name_of: impl Fn(&str) -> String,
        prefix: &str,
    ) -> ProjectionPlan {
        match &scan.columns {
            ColumnSet::All => ProjectionPlan::Natural {
                prefix: prefix.to_string(),
            },
            ColumnSet::Named(columns) => {
                let mut items: Vec<ProjectionItem> = columns
                    .iter()
                    .filter(|c| c.as_str() != GEOMETRY_COLUMN)
                    .map(|c| ProjectionItem::Column {
                        name: name_of(c),
                        location: Location::from_column(c),
                    })
                    .collect();
                items.push(ProjectionItem::Geometry {
                    name: name_of(GEOMETRY_COLUMN),
                });
                ProjectionPlan::Items(items)
            }
        }
    }

    /// First feature of `collection` with the natural projection.
    pub fn sample_query(&self, collection: &str, variant: &BackendVariant) -> EngineResult<String> {
        let namespace = self.namespace(variant)?;
        let items = self.render_projection(
            &ProjectionPlan::Natural {
                prefix: String::new(),
            },
            "$f",
            namespace,
        );
        Ok(format!(
            "{}(for $f in {} return <result>{{{}}}</result>)[1]",
            self.prolog(namespace),
            self.features(collection, namespace.flavor),
            items.join(", ")
        ))
    }

    fn compile_single(&self, request: &FetchRequest, scan: &CollectionScan) -> EngineResult<String> {
        let namespace = self.namespace(&request.variant)?;
        let predicate = self
            .build_selection(&scan.predicate, &request.variant)
            .render("$f", namespace);
        let mut query = self.prolog(namespace);
        query.push_str(&format!(
            "for $f in {}\nwhere {predicate}\n",
            self.features(&scan.collection.name, namespace.flavor)
        ));

        if request.aggregates.is_empty() && request.group_by.is_empty() {
            let plan = self.build_projection(&scan.columns, &request.variant);
            let items = self.render_projection(&plan, "$f", namespace);
            query.push_str(&format!("return <result>{{{}}}</result>", items.join(", ")));
            return Ok(query);
        }

        let mut items = Vec::new();
        if !request.group_by.is_empty() {
            let keys: Vec<String> = request
                .group_by
                .iter()
                .enumerate()
                // Absent and empty values share the empty-sequence key, which
                // comes back as an empty element and so as NULL.
                .map(|(i, column)| {
                    format!(
                        "$g{i} := string(({})[1])[. != '']",
                        Location::from_column(column).render("$f", namespace.flavor)
                    )
                })
                .collect();
            query.push_str(&format!("group by {}\n", keys.join(", ")));
            for (i, column) in request.group_by.iter().enumerate() {
                items.push(format!("element {{{}}} {{$g{i}}}", xq_string(column)));
            }
        }
        for aggregate in &request.aggregates {
            items.push(self.render_aggregate(aggregate, "$f", namespace)?);
        }

        if request.group_by.is_empty() {
            // Global aggregation: one row even when nothing matched.
            let features = query.split_off(self.prolog(namespace).len());
            query.push_str(&format!(
                "let $f := ({features}return $f)\nreturn <result>{{{}}}</result>",
                items.join(", ")
            ));
        } else {
            query.push_str(&format!("return <result>{{{}}}</result>", items.join(", ")));
        }
        Ok(query)
    }

    fn render_aggregate(
        &self,
        aggregate: &Aggregate,
        group: &str,
        namespace: &SpatialNamespace,
    ) -> EngineResult<String> {
        if !aggregate.function.eq_ignore_ascii_case("count") {
            return Err(EngineError::not_supported(format!(
                "aggregate {} in XQuery",
                aggregate.function
            )));
        }
        let counted = match &aggregate.column {
            None => format!("count({group})"),
            Some(column) => format!(
                "count({group}[exists({}[. != ''])])",
                Location::from_column(column).render(".", namespace.flavor)
            ),
        };
        Ok(format!(
            "element {{{}}} {{{counted}}}",
            xq_string(&aggregate.output_name())
        ))
    }

    fn compile_join(&self, request: &FetchRequest) -> EngineResult<String> {
        let namespace = self.namespace(&request.variant)?;
        let [left, right] = request.scans.as_slice() else {
            return Err(EngineError::not_supported(
                "backend joins take exactly two collections",
            ));
        };
        let kind = right.collection.join_kind.unwrap_or(JoinKind::Inner);
        let condition = right
            .collection
            .join_condition
            .as_ref()
            .ok_or_else(|| EngineError::not_supported("backend joins need an ON condition"))?;
        let condition = self.lower_join_condition(condition, left, right, namespace)?;

        let left_plan = self.side_projection(
            left,
            |c| joined_column_name(&left.collection.alias, c),
            &format!("{}__", left.collection.alias),
        );
        let right_plan = self.side_projection(
            right,
            |c| joined_column_name(&right.collection.alias, c),
            &format!("{}__", right.collection.alias),
        );
        let left_items = self.render_projection(&left_plan, "$a", namespace);
        let right_items = self.render_projection(&right_plan, "$b", namespace);

        let mut query = self.prolog(namespace);
        for (var, scan) in [("$left", left), ("$right", right)] {
            let predicate = self
                .build_selection(&scan.predicate, &request.variant)
                .render("$f", namespace);
            query.push_str(&format!(
                "let {var} := for $f in {} where {predicate} return $f\n",
                self.features(&scan.collection.name, namespace.flavor)
            ));
        }

        let both = [left_items.clone(), right_items.clone()].concat().join(", ");
        match kind {
            JoinKind::Inner => query.push_str(&format!(
                "for $a in $left\nfor $b in $right\nwhere {condition}\nreturn <result>{{{both}}}</result>"
            )),
            JoinKind::Left => {
                let skeleton = skeleton(&right_plan)?;
                let unmatched = [left_items, skeleton].concat().join(", ");
                query.push_str(&format!(
                    "for $a in $left\nlet $matches := for $b in $right where {condition} return $b\n\
                     return if (empty($matches)) then <result>{{{unmatched}}}</result>\n\
                     else for $b in $matches return <result>{{{both}}}</result>"
                ));
            }
            JoinKind::Right => {
                let skeleton = skeleton(&left_plan)?;
                let unmatched = [skeleton, right_items].concat().join(", ");
                query.push_str(&format!(
                    "for $b in $right\nlet $matches := for $a in $left where {condition} return $a\n\
                     return if (empty($matches)) then <result>{{{unmatched}}}</result>\n\
                     else for $a in $matches return <result>{{{both}}}</result>"
                ));
            }
            JoinKind::Full | JoinKind::Cross => {
                return Err(EngineError::not_supported(format!(
                    "{} in XQuery",
                    kind.keyword()
                )))
            }
        }
        Ok(query)
    }

    /// Lowers an equi-join style ON clause: AND-ed comparisons between a
    /// column of each side.
    fn lower_join_condition(
        &self,
        condition: &Expr,
        left: &CollectionScan,
        right: &CollectionScan,
        namespace: &SpatialNamespace,
    ) -> EngineResult<String> {
        let variable = |column: &ColumnRef| match column.table.as_deref() {
            Some(t) if t == left.collection.alias => Some("$a"),
            Some(t) if t == right.collection.alias => Some("$b"),
            _ => None,
        };
        let mut tests = Vec::new();
        for conjunct in condition.conjuncts() {
            let Expr::Binary { op, left: l, right: r } = conjunct else {
                return Err(EngineError::not_supported("join condition shape"));
            };
            let (Expr::Column(lc), Expr::Column(rc)) = (l.as_ref(), r.as_ref()) else {
                return Err(EngineError::not_supported("join condition shape"));
            };
            let token = comparison_token(*op)
                .filter(|_| self.capability.supports_operator(*op))
                .ok_or_else(|| EngineError::not_supported(format!("join operator {op}")))?;
            let (Some(lv), Some(rv)) = (variable(lc), variable(rc)) else {
                return Err(EngineError::not_supported("join condition references"));
            };
            tests.push(format!(
                "{} {token} {}",
                Location::from_column(&lc.column).render(lv, namespace.flavor),
                Location::from_column(&rc.column).render(rv, namespace.flavor)
            ));
        }
        if tests.is_empty() {
            return Err(EngineError::not_supported("empty join condition"));
        }
        Ok(tests.join(" and "))
    }
}

/// Empty elements standing in for an unmatched outer-join side.
fn skeleton(plan: &ProjectionPlan) -> EngineResult<Vec<String>> {
    match plan {
        ProjectionPlan::Natural { .. } => Err(EngineError::not_supported(
            "outer join with a wildcard projection",
        )),
        ProjectionPlan::Items(items) => Ok(items
            .iter()
            .map(|item| {
                let name = match item {
                    ProjectionItem::Column { name, .. }
                    | ProjectionItem::Geometry { name }
                    | ProjectionItem::Empty { name } => name,
                };
                format!("element {{{}}} {{()}}", xq_string(name))
            })
            .collect()),
    }
}

fn comparison_token(op: BinaryOp) -> Option<&'static str> {
    Some(match op {
        BinaryOp::Eq => "=",
        BinaryOp::NotEq => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::LtEq => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::GtEq => ">=",
        _ => return None,
    })
}

impl QueryCompiler for XQueryCompiler<'_> {
    type Selection = Predicate;
    type Projection = ProjectionPlan;

    fn build_selection(&self, predicate: &Expr, variant: &BackendVariant) -> Predicate {
        self.lower(predicate, variant)
    }

    fn build_projection(&self, columns: &ColumnSet, _variant: &BackendVariant) -> ProjectionPlan {
        match columns {
            ColumnSet::All => ProjectionPlan::Natural {
                prefix: String::new(),
            },
            ColumnSet::Named(names) => {
                let mut items: Vec<ProjectionItem> = names
                    .iter()
                    .filter(|n| n.as_str() != GEOMETRY_COLUMN)
                    .map(|n| ProjectionItem::Column {
                        name: n.clone(),
                        location: Location::from_column(n),
                    })
                    .collect();
                items.push(ProjectionItem::Geometry {
                    name: GEOMETRY_COLUMN.to_string(),
                });
                ProjectionPlan::Items(items)
            }
        }
    }

    fn compile(&self, request: &FetchRequest) -> EngineResult<NativeQuery> {
        let text = match request.scans.as_slice() {
            [] => return Err(EngineError::internal("fetch request without collections")),
            [scan] => self.compile_single(request, scan)?,
            _ => {
                if !self.capability.can_join {
                    return Err(EngineError::not_supported("backend joins"));
                }
                if !request.aggregates.is_empty() || !request.group_by.is_empty() {
                    return Err(EngineError::not_supported("grouping over a backend join"));
                }
                self.compile_join(request)?
            }
        };
        Ok(NativeQuery::XQuery(text))
    }
}

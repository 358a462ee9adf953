// SPDX-License-Identifier: BUSL-1.1

//! Capability descriptors.
//!
//! Each driver owns one descriptor, built once in its constructor and only
//! read afterwards. The classifier asks it which conjuncts a backend can
//! evaluate; the compilers ask it how to spell operators and which function
//! pattern a predicate matched.
//!
//! Function predicates are matched through a canonical signature string.
//! `ST_Distance(p.geometry, '{..}') <= 500` becomes
//! `st_distance(p.geometry,$s0)<=$n1`: columns are written qualified, string
//! and number constants become numbered placeholders and booleans are inlined.
//! Patterns are regular expressions over that string with the named captures
//! `func`, `col`, `op`, `c1` and `c2` (placeholder indices).

use regex::Regex;

use crate::engine::types::BackendKind;
use crate::federation::types::{BackendVariant, SpatialFlavor};
use crate::query::{BinaryOp, ColumnRef, Expr, Literal, LiteralKind};

/// Prefix of column names whose XML location could not be decided statically.
pub const AMBIGUOUS_MARKER: &str = "_undef__";

/// Name of the spatial field in every backend.
pub const GEOMETRY_COLUMN: &str = "geometry";

/// Stock signature patterns shared by the drivers.
pub mod patterns {
    /// `mod(t.c, n) = m`, also written `t.c % n = m`
    pub const MOD_EQ: &str = r"^(?P<func>mod)\((?P<col>\w+\.\w+),\$n(?P<c1>\d+)\)(?P<op>=)\$n(?P<c2>\d+)$";
    /// `mod(t.c, n) <op> m`
    pub const MOD_CMP: &str =
        r"^(?P<func>mod)\((?P<col>\w+\.\w+),\$n(?P<c1>\d+)\)(?P<op>=|!=|<=|>=|<|>)\$n(?P<c2>\d+)$";
    /// `date(t.c) = 'yyyy-mm-dd'` and `<`
    pub const DATE_EQ_LT: &str = r"^(?P<func>date)\((?P<col>\w+\.\w+)\)(?P<op>=|<)\$s(?P<c1>\d+)$";
    /// `date(t.c) <op> 'yyyy-mm-dd'`
    pub const DATE_CMP: &str =
        r"^(?P<func>date)\((?P<col>\w+\.\w+)\)(?P<op>=|!=|<=|>=|<|>)\$s(?P<c1>\d+)$";
    pub const DISTANCE: &str = r"^(?P<func>st_distance)\((?P<col>\w+\.geometry),\$s(?P<c1>\d+)\)(?P<op><=|>=|=)\$n(?P<c2>\d+)$";
    pub const DISTANCE_REVERSED: &str = r"^(?P<func>st_distance)\(\$s(?P<c1>\d+),(?P<col>\w+\.geometry)\)(?P<op><=|>=|=)\$n(?P<c2>\d+)$";
    /// Full distance comparison set, for backends evaluating the distance itself
    pub const DISTANCE_CMP: &str = r"^(?P<func>st_distance)\((?P<col>\w+\.geometry),\$s(?P<c1>\d+)\)(?P<op>=|!=|<=|>=|<|>)\$n(?P<c2>\d+)$";
    pub const WITHIN: &str =
        r"^(?P<func>st_within)\((?P<col>\w+\.geometry),\$s(?P<c1>\d+)\)(?:=true)?$";
    pub const INTERSECTS: &str =
        r"^(?P<func>st_intersects)\((?P<col>\w+\.geometry),\$s(?P<c1>\d+)\)(?:=true)?$";
    pub const INTERSECTS_REVERSED: &str =
        r"^(?P<func>st_intersects)\(\$s(?P<c1>\d+),(?P<col>\w+\.geometry)\)(?:=true)?$";
    pub const DIMENSION: &str =
        r"^(?P<func>st_dimension)\((?P<col>\w+\.geometry)\)(?P<op>=|!=|<=|>=|<|>)\$n(?P<c1>\d+)$";
    pub const SRID: &str =
        r"^(?P<func>st_srid)\((?P<col>\w+\.geometry)\)(?P<op>=|!=|<=|>=|<|>)\$n(?P<c1>\d+)$";
    pub const GEOMETRY_TYPE: &str =
        r"^(?P<func>st_geometrytype)\((?P<col>\w+\.geometry)\)(?P<op>=|!=)\$s(?P<c1>\d+)$";
}

/// Extra check a driver can attach to a pattern, run on the captured values.
pub type MatchValidator = fn(&FunctionMatch) -> bool;

/// A pushable function signature.
#[derive(Debug, Clone)]
pub struct FunctionPattern {
    /// Lowering key, e.g. `distance`
    pub name: &'static str,
    regex: Regex,
    validator: Option<MatchValidator>,
}

impl FunctionPattern {
    /// Compiles `pattern`. An invalid pattern is logged and skipped.
    pub fn new(name: &'static str, pattern: &str) -> Option<Self> {
        match Regex::new(pattern) {
            Ok(regex) => Some(Self {
                name,
                regex,
                validator: None,
            }),
            Err(e) => {
                tracing::warn!(pattern = name, error = %e, "Skipping invalid function pattern");
                None
            }
        }
    }

    pub fn validated(mut self, validator: MatchValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    fn try_match(&self, signature: &Signature) -> Option<FunctionMatch> {
        let caps = self.regex.captures(&signature.text)?;
        let function = caps.name("func")?.as_str().to_string();
        let column = parse_column(caps.name("col")?.as_str())?;
        let op = match caps.name("op") {
            Some(op) => Some(parse_op(op.as_str())?),
            None => None,
        };
        let mut constants = Vec::new();
        for name in ["c1", "c2"] {
            if let Some(index) = caps.name(name) {
                let index: usize = index.as_str().parse().ok()?;
                constants.push(signature.constants.get(index)?.clone());
            }
        }
        let found = FunctionMatch {
            pattern: self.name,
            function,
            column,
            constants,
            op,
        };
        match self.validator {
            Some(check) if !check(&found) => None,
            _ => Some(found),
        }
    }
}

/// A function predicate recognized by a pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionMatch {
    pub pattern: &'static str,
    /// Lowercase SQL function name
    pub function: String,
    pub column: ColumnRef,
    /// Captured constants, `c1` then `c2`
    pub constants: Vec<Literal>,
    /// Comparison operator, `None` for bare boolean predicates
    pub op: Option<BinaryOp>,
}

impl FunctionMatch {
    pub fn constant(&self, index: usize) -> Option<&Literal> {
        self.constants.get(index)
    }

    pub fn number(&self, index: usize) -> Option<f64> {
        match self.constants.get(index)? {
            Literal::Number(n) => n.parse().ok(),
            _ => None,
        }
    }

    pub fn text(&self, index: usize) -> Option<&str> {
        match self.constants.get(index)? {
            Literal::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Static description of what a backend evaluates natively.
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    pub backend_kind: BackendKind,
    pub literal_kinds: Vec<LiteralKind>,
    /// Source operator to backend token
    pub operators: Vec<(BinaryOp, &'static str)>,
    pub selection_functions: Vec<FunctionPattern>,
    /// Pattern names allowed per spatial flavor; flavors without an entry
    /// allow every pattern
    pub flavor_functions: Vec<(SpatialFlavor, Vec<&'static str>)>,
    /// Aggregates the backend computes in a projection, e.g. `count`
    pub projection_functions: Vec<&'static str>,
    pub can_join: bool,
    pub supports_group_by: bool,
    pub requires_probe: bool,
}

impl CapabilityDescriptor {
    pub fn new(backend_kind: BackendKind) -> Self {
        Self {
            backend_kind,
            literal_kinds: Vec::new(),
            operators: Vec::new(),
            selection_functions: Vec::new(),
            flavor_functions: Vec::new(),
            projection_functions: Vec::new(),
            can_join: false,
            supports_group_by: false,
            requires_probe: false,
        }
    }

    pub fn with_literals(mut self, kinds: &[LiteralKind]) -> Self {
        self.literal_kinds = kinds.to_vec();
        self
    }

    pub fn with_operators(mut self, operators: &[(BinaryOp, &'static str)]) -> Self {
        self.operators = operators.to_vec();
        self
    }

    /// Adds `(name, pattern)` pairs; invalid patterns are dropped.
    pub fn with_functions(mut self, functions: &[(&'static str, &str)]) -> Self {
        self.selection_functions.extend(
            functions
                .iter()
                .filter_map(|(name, pattern)| FunctionPattern::new(name, pattern)),
        );
        self
    }

    pub fn with_function(mut self, pattern: Option<FunctionPattern>) -> Self {
        self.selection_functions.extend(pattern);
        self
    }

    pub fn with_flavor_functions(mut self, flavor: SpatialFlavor, names: &[&'static str]) -> Self {
        self.flavor_functions.push((flavor, names.to_vec()));
        self
    }

    pub fn with_projection_functions(mut self, names: &[&'static str]) -> Self {
        self.projection_functions = names.to_vec();
        self
    }

    pub fn joins(mut self, can_join: bool) -> Self {
        self.can_join = can_join;
        self
    }

    pub fn grouping(mut self, supports_group_by: bool) -> Self {
        self.supports_group_by = supports_group_by;
        self
    }

    pub fn probe(mut self, requires_probe: bool) -> Self {
        self.requires_probe = requires_probe;
        self
    }

    /// Backend token for `op`, if the backend has one.
    pub fn translate(&self, op: BinaryOp) -> Option<&'static str> {
        self.operators
            .iter()
            .find(|(source, _)| *source == op)
            .map(|(_, token)| *token)
    }

    pub fn supports_operator(&self, op: BinaryOp) -> bool {
        self.translate(op).is_some()
    }

    pub fn supports_literal(&self, kind: LiteralKind) -> bool {
        self.literal_kinds.contains(&kind)
    }

    pub fn supports_projection_function(&self, name: &str) -> bool {
        self.projection_functions
            .iter()
            .any(|f| f.eq_ignore_ascii_case(name))
    }

    /// Matches a function predicate against the pattern table, honouring the
    /// per-flavor function lists of the variant.
    pub fn match_function(&self, expr: &Expr, variant: &BackendVariant) -> Option<FunctionMatch> {
        let signature = Signature::of(expr)?;
        let found = self
            .selection_functions
            .iter()
            .find_map(|pattern| pattern.try_match(&signature))?;
        if let Some(flavor) = variant.flavor() {
            if let Some((_, allowed)) = self.flavor_functions.iter().find(|(f, _)| *f == flavor) {
                if !allowed.contains(&found.pattern) {
                    return None;
                }
            }
        }
        Some(found)
    }

    /// True for column names that must always be evaluated locally.
    pub fn is_ambiguous_column(column: &str) -> bool {
        column.starts_with(AMBIGUOUS_MARKER)
    }
}

/// Canonical text of a function predicate plus the constants it references.
#[derive(Debug, Clone, PartialEq)]
struct Signature {
    text: String,
    constants: Vec<Literal>,
}

impl Signature {
    fn of(expr: &Expr) -> Option<Self> {
        let mut signature = Signature {
            text: String::new(),
            constants: Vec::new(),
        };
        match expr {
            Expr::Function { .. } => signature.push_call(expr)?,
            Expr::Binary { op, left, right } if op.is_comparison() => {
                let (call, op, value) = if is_call(left) {
                    (left.as_ref(), *op, right.as_ref())
                } else if is_call(right) {
                    (right.as_ref(), op.flipped()?, left.as_ref())
                } else {
                    return None;
                };
                signature.push_call(call)?;
                signature.text.push_str(op.symbol());
                signature.push_operand(value)?;
            }
            _ => return None,
        }
        Some(signature)
    }

    fn push_call(&mut self, expr: &Expr) -> Option<()> {
        match expr {
            Expr::Function { name, args } => {
                self.text.push_str(&name.to_ascii_lowercase());
                self.text.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        self.text.push(',');
                    }
                    self.push_operand(arg)?;
                }
                self.text.push(')');
                Some(())
            }
            Expr::Binary {
                op: BinaryOp::Modulo,
                left,
                right,
            } => {
                self.text.push_str("mod(");
                self.push_operand(left)?;
                self.text.push(',');
                self.push_operand(right)?;
                self.text.push(')');
                Some(())
            }
            _ => None,
        }
    }

    fn push_operand(&mut self, expr: &Expr) -> Option<()> {
        match expr {
            Expr::Column(ColumnRef {
                table: Some(table),
                column,
            }) => {
                self.text.push_str(table);
                self.text.push('.');
                self.text.push_str(column);
            }
            Expr::Column(ColumnRef { table: None, column }) => self.text.push_str(column),
            Expr::Literal(Literal::Bool(b)) => self.text.push_str(if *b { "true" } else { "false" }),
            Expr::Literal(Literal::Null) => self.text.push_str("null"),
            Expr::Literal(lit @ (Literal::Number(_) | Literal::String(_))) => {
                let tag = if matches!(lit, Literal::Number(_)) { 'n' } else { 's' };
                self.text.push('$');
                self.text.push(tag);
                self.text.push_str(&self.constants.len().to_string());
                self.constants.push(lit.clone());
            }
            _ => return None,
        }
        Some(())
    }
}

fn is_call(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Function { .. }
            | Expr::Binary {
                op: BinaryOp::Modulo,
                ..
            }
    )
}

fn parse_column(text: &str) -> Option<ColumnRef> {
    let (table, column) = text.split_once('.')?;
    Some(ColumnRef::qualified(table, column))
}

fn parse_op(symbol: &str) -> Option<BinaryOp> {
    Some(match symbol {
        "=" => BinaryOp::Eq,
        "!=" => BinaryOp::NotEq,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::LtEq,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::GtEq,
        _ => return None,
    })
}

// SPDX-License-Identifier: BUSL-1.1

//! BaseX Driver
//!
//! XQuery over the BaseX REST API. Collections are resources of one
//! database holding GML feature collections or KML documents; which of the
//! two a collection uses is discovered by the pre-fetch probe.

use std::sync::OnceLock;

use async_trait::async_trait;

use crate::config::BackendConfig;
use crate::engine::drivers::xml_rest::{
    self, has_markup_literal, RestDialect, XmlRestClient, PROBE_FAILED_MESSAGE, XML_OPERATORS,
};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::BackendDriver;
use crate::engine::types::BackendKind;
use crate::federation::capability::{patterns, CapabilityDescriptor, FunctionPattern};
use crate::federation::compiler::xquery::{xq_string, SourceKind};
use crate::federation::compiler::{NativeQuery, QueryCompiler, XQueryCompiler, XQueryDialect};
use crate::federation::types::{
    BackendVariant, FetchRequest, GeometryEncoding, RawResult, SpatialFlavor, StandardRow,
};
use crate::query::LiteralKind;

/// Maps a detected version onto the collection accessor it supports.
fn source_for_version(version: &str) -> EngineResult<SourceKind> {
    match xml_rest::major_version(version) {
        Some(7..=9) => Ok(SourceKind::DbOpen),
        Some(10..) => Ok(SourceKind::DbGet),
        _ => Err(EngineError::unsupported_version("BaseX", version)),
    }
}

fn capabilities() -> CapabilityDescriptor {
    let spatial = |name, pattern| {
        FunctionPattern::new(name, pattern).map(|p| p.validated(has_markup_literal))
    };
    CapabilityDescriptor::new(BackendKind::Xml)
        .with_literals(&[
            LiteralKind::Number,
            LiteralKind::String,
            LiteralKind::Null,
            LiteralKind::List,
        ])
        .with_operators(XML_OPERATORS)
        .with_functions(&[
            ("mod", patterns::MOD_CMP),
            ("date", patterns::DATE_CMP),
            ("dimension", patterns::DIMENSION),
            ("srid", patterns::SRID),
            ("geometry_type", patterns::GEOMETRY_TYPE),
        ])
        .with_function(spatial("distance", patterns::DISTANCE_CMP))
        .with_function(spatial("within", patterns::WITHIN))
        .with_function(spatial("intersects", patterns::INTERSECTS))
        .with_function(spatial("intersects", patterns::INTERSECTS_REVERSED))
        .with_flavor_functions(
            SpatialFlavor::Gml,
            &[
                "mod",
                "date",
                "distance",
                "within",
                "intersects",
                "dimension",
                "srid",
                "geometry_type",
            ],
        )
        .with_flavor_functions(SpatialFlavor::Kml, &["mod", "date"])
        .probe(true)
}

pub struct BaseXDriver {
    client: XmlRestClient,
    database: String,
    version_override: Option<String>,
    capabilities: CapabilityDescriptor,
    dialect: OnceLock<XQueryDialect>,
}

impl BaseXDriver {
    pub fn new(config: &BackendConfig) -> EngineResult<Self> {
        Ok(Self {
            client: XmlRestClient::new(config, RestDialect::BaseX)?,
            database: config.database.clone(),
            version_override: config.version.clone(),
            capabilities: capabilities(),
            dialect: OnceLock::new(),
        })
    }

    fn dialect(&self) -> EngineResult<&XQueryDialect> {
        self.dialect
            .get()
            .ok_or_else(|| EngineError::connection_failed("BaseX driver is not connected"))
    }

    fn compiler(&self) -> EngineResult<XQueryCompiler<'_>> {
        Ok(XQueryCompiler::new(&self.capabilities, self.dialect()?.clone()))
    }
}

#[async_trait]
impl BackendDriver for BaseXDriver {
    fn driver_id(&self) -> &'static str {
        "basex"
    }

    fn driver_name(&self) -> &'static str {
        "BaseX"
    }

    fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    async fn connect(&self) -> EngineResult<()> {
        let version = match &self.version_override {
            Some(version) => version.clone(),
            None => xml_rest::parse_text(&self.client.query("data(db:system()//version)").await?)?,
        };
        let source = source_for_version(&version)?;
        tracing::info!(version = %version, source = ?source, "BaseX: connected");
        // A second connect keeps the first dialect.
        let _ = self.dialect.set(XQueryDialect {
            source,
            database: self.database.clone(),
            geo_module: true,
        });
        Ok(())
    }

    async fn probe(&self, collection: &str) -> EngineResult<BackendVariant> {
        let query = xml_rest::probe_query(&self.dialect()?.source_expr(collection));
        let body = self.client.query(&query).await?;
        let namespace = xml_rest::parse_probe(&body)?
            .ok_or_else(|| EngineError::probe_failed(collection, PROBE_FAILED_MESSAGE))?;
        tracing::debug!(collection, flavor = ?namespace.flavor, uri = %namespace.uri, "BaseX: probed");
        Ok(BackendVariant {
            namespace: Some(namespace),
        })
    }

    fn compile(&self, request: &FetchRequest) -> EngineResult<NativeQuery> {
        self.compiler()?.compile(request)
    }

    async fn fetch(&self, request: &FetchRequest) -> EngineResult<RawResult> {
        let NativeQuery::XQuery(query) = self.compile(request)? else {
            return Err(EngineError::internal("BaseX compiled a non-XQuery request"));
        };
        tracing::debug!(collection = %request.label(), query = %query, "BaseX: running XQuery");
        let body = self.client.query(&query).await?;
        Ok(RawResult::Markup(vec![body]))
    }

    fn standardize(&self, raw: RawResult) -> EngineResult<Vec<StandardRow>> {
        match raw {
            RawResult::Markup(chunks) => xml_rest::standardize_markup(&chunks),
            RawResult::Documents(_) => Err(EngineError::internal(
                "BaseX cannot standardize JSON documents",
            )),
        }
    }

    fn geometry_encoding(&self, variant: &BackendVariant) -> GeometryEncoding {
        match variant.flavor() {
            Some(SpatialFlavor::Kml) => GeometryEncoding::Kml,
            _ => GeometryEncoding::Wkt,
        }
    }

    async fn list_fields(&self, collection: &str) -> EngineResult<Vec<String>> {
        let variant = self.probe(collection).await?;
        let query = self.compiler()?.sample_query(collection, &variant)?;
        let rows = xml_rest::standardize_markup(&[self.client.query(&query).await?])?;
        Ok(rows
            .first()
            .map(|row| row.properties.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_collections(&self) -> EngineResult<Vec<String>> {
        let query = format!(
            "for $r in db:list({}) return element r {{$r}}",
            xq_string(&self.database)
        );
        xml_rest::parse_names(&self.client.query(&query).await?)
    }
}

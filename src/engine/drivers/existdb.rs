// SPDX-License-Identifier: BUSL-1.1

//! eXist-db Driver
//!
//! XQuery over the eXist-db REST API. Each collection is an eXist
//! sub-collection `/db/<database>/<collection>` of GML documents. eXist
//! evaluates joins between two collections and `count` grouping itself.

use std::sync::OnceLock;

use async_trait::async_trait;

use crate::config::BackendConfig;
use crate::engine::drivers::xml_rest::{
    self, RestDialect, XmlRestClient, PROBE_FAILED_MESSAGE, XML_OPERATORS,
};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::BackendDriver;
use crate::engine::types::BackendKind;
use crate::federation::capability::{patterns, CapabilityDescriptor};
use crate::federation::compiler::xquery::{xq_string, SourceKind};
use crate::federation::compiler::{NativeQuery, QueryCompiler, XQueryCompiler, XQueryDialect};
use crate::federation::types::{
    BackendVariant, FetchRequest, GeometryEncoding, RawResult, SpatialFlavor, StandardRow,
};
use crate::query::LiteralKind;

fn source_for_version(version: &str) -> EngineResult<SourceKind> {
    match xml_rest::major_version(version) {
        Some(5 | 6) => Ok(SourceKind::Collection),
        _ => Err(EngineError::unsupported_version("eXist-db", version)),
    }
}

fn capabilities() -> CapabilityDescriptor {
    CapabilityDescriptor::new(BackendKind::Xml)
        .with_literals(&[
            LiteralKind::Number,
            LiteralKind::String,
            LiteralKind::Null,
            LiteralKind::List,
        ])
        .with_operators(XML_OPERATORS)
        .with_functions(&[("mod", patterns::MOD_CMP), ("date", patterns::DATE_CMP)])
        .with_flavor_functions(SpatialFlavor::Gml, &["mod", "date"])
        .with_projection_functions(&["count"])
        .joins(true)
        .grouping(true)
        .probe(true)
}

pub struct ExistDbDriver {
    client: XmlRestClient,
    database: String,
    version_override: Option<String>,
    capabilities: CapabilityDescriptor,
    dialect: OnceLock<XQueryDialect>,
}

impl ExistDbDriver {
    pub fn new(config: &BackendConfig) -> EngineResult<Self> {
        Ok(Self {
            client: XmlRestClient::new(config, RestDialect::Exist)?,
            database: config.database.clone(),
            version_override: config.version.clone(),
            capabilities: capabilities(),
            dialect: OnceLock::new(),
        })
    }

    fn compiler(&self) -> EngineResult<XQueryCompiler<'_>> {
        let dialect = self
            .dialect
            .get()
            .ok_or_else(|| EngineError::connection_failed("eXist-db driver is not connected"))?;
        Ok(XQueryCompiler::new(&self.capabilities, dialect.clone()))
    }

    fn source(&self, collection: &str) -> String {
        XQueryDialect {
            source: SourceKind::Collection,
            database: self.database.clone(),
            geo_module: false,
        }
        .source_expr(collection)
    }
}

#[async_trait]
impl BackendDriver for ExistDbDriver {
    fn driver_id(&self) -> &'static str {
        "existdb"
    }

    fn driver_name(&self) -> &'static str {
        "eXist-db"
    }

    fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    async fn connect(&self) -> EngineResult<()> {
        let version = match &self.version_override {
            Some(version) => version.clone(),
            None => xml_rest::parse_text(&self.client.query("system:get-version()").await?)?,
        };
        let source = source_for_version(&version)?;
        tracing::info!(version = %version, "eXist-db: connected");
        let _ = self.dialect.set(XQueryDialect {
            source,
            database: self.database.clone(),
            geo_module: false,
        });
        Ok(())
    }

    async fn probe(&self, collection: &str) -> EngineResult<BackendVariant> {
        let body = self
            .client
            .query(&xml_rest::probe_query(&self.source(collection)))
            .await?;
        let namespace = xml_rest::parse_probe(&body)?
            .filter(|ns| ns.flavor == SpatialFlavor::Gml)
            .ok_or_else(|| EngineError::probe_failed(collection, PROBE_FAILED_MESSAGE))?;
        tracing::debug!(collection, uri = %namespace.uri, "eXist-db: probed");
        Ok(BackendVariant {
            namespace: Some(namespace),
        })
    }

    fn compile(&self, request: &FetchRequest) -> EngineResult<NativeQuery> {
        self.compiler()?.compile(request)
    }

    async fn fetch(&self, request: &FetchRequest) -> EngineResult<RawResult> {
        let NativeQuery::XQuery(query) = self.compile(request)? else {
            return Err(EngineError::internal("eXist-db compiled a non-XQuery request"));
        };
        tracing::debug!(collection = %request.label(), query = %query, "eXist-db: running XQuery");
        Ok(RawResult::Markup(vec![self.client.query(&query).await?]))
    }

    fn standardize(&self, raw: RawResult) -> EngineResult<Vec<StandardRow>> {
        match raw {
            RawResult::Markup(chunks) => xml_rest::standardize_markup(&chunks),
            RawResult::Documents(_) => Err(EngineError::internal(
                "eXist-db cannot standardize JSON documents",
            )),
        }
    }

    fn geometry_encoding(&self, _variant: &BackendVariant) -> GeometryEncoding {
        GeometryEncoding::Gml
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
            "for $c in xmldb:get-child-collections({}) return element r {{$c}}",
            xq_string(&format!("/db/{}", self.database))
        );
        xml_rest::parse_names(&self.client.query(&query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::types::{CollectionDescriptor, CollectionScan, ColumnSet};
    use crate::query::{BinaryOp, Expr, JoinKind};

    fn driver(version: &str) -> ExistDbDriver {
        ExistDbDriver::new(&BackendConfig {
            driver: "existdb".into(),
            url: "http://localhost:8080/exist".into(),
            database: "gis".into(),
            version: Some(version.into()),
            ..BackendConfig::default()
        })
        .unwrap()
    }

    fn scan(name: &str, join: Option<(JoinKind, Expr)>, columns: &[&str]) -> CollectionScan {
        let (join_kind, join_condition) = match join {
            Some((kind, on)) => (Some(kind), Some(on)),
            None => (None, None),
        };
        CollectionScan {
            collection: CollectionDescriptor {
                name: name.into(),
                alias: name.into(),
                join_kind,
                join_condition,
            },
            predicate: Expr::boolean(true),
            columns: ColumnSet::named(columns.iter().copied()),
        }
    }

    #[test]
    fn version_table() {
        assert_eq!(source_for_version("5.3.1").unwrap(), SourceKind::Collection);
        assert_eq!(source_for_version("6.2.0").unwrap(), SourceKind::Collection);
        assert!(matches!(
            source_for_version("4.7"),
            Err(EngineError::UnsupportedVersion { .. })
        ));
    }

    #[tokio::test]
    async fn unsupported_override_fails_connect() {
        let err = driver("3.0").connect().await.unwrap_err();
        assert_eq!(err.to_string(), "unsupported backend version: 3.0 (eXist-db)");
    }

    #[tokio::test]
    async fn compiles_join_as_one_query() {
        let driver = driver("6.2.0");
        driver.connect().await.unwrap();
        let on = Expr::binary(BinaryOp::Eq, Expr::column("a", "id"), Expr::column("b", "aid"));
        let variant = BackendVariant::with_namespace(SpatialFlavor::Gml, "http://www.opengis.net/gml");
        let request = FetchRequest {
            scans: vec![
                scan("a", None, &["id"]),
                scan("b", Some((JoinKind::Inner, on)), &["aid"]),
            ],
            ..FetchRequest::single(scan("a", None, &[]), variant)
        };
        let NativeQuery::XQuery(text) = driver.compile(&request).unwrap() else {
            panic!("expected XQuery");
        };
        assert!(text.contains("collection('/db/gis/a')"));
        assert!(text.contains("collection('/db/gis/b')"));
        assert!(!text.contains("import module"));
    }

    #[test]
    fn capabilities_advertise_grouping_and_joins() {
        let caps = capabilities();
        assert!(caps.can_join);
        assert!(caps.supports_group_by);
        assert!(caps.requires_probe);
        assert!(caps.supports_projection_function("COUNT"));
        assert!(!caps.supports_projection_function("sum"));
    }

    #[test]
    fn gml_is_the_only_encoding() {
        assert_eq!(
            driver("6.0").geometry_encoding(&BackendVariant::default()),
            GeometryEncoding::Gml
        );
    }
}

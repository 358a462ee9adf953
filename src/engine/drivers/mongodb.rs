// SPDX-License-Identifier: BUSL-1.1

//! MongoDB Driver
//!
//! Collections hold GeoJSON features (`{geometry, properties}`). Filters and
//! projections come from the document compiler and run through `find`.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::{ClientOptions, Credential};
use mongodb::Client;
use tokio::sync::RwLock;

use crate::config::BackendConfig;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::BackendDriver;
use crate::engine::types::BackendKind;
use crate::federation::capability::{patterns, CapabilityDescriptor, FunctionPattern};
use crate::federation::compiler::document::has_geojson_literal;
use crate::federation::compiler::{DocumentCompiler, NativeQuery, ProjectionStyle, QueryCompiler};
use crate::federation::types::{
    BackendVariant, FetchRequest, GeometryEncoding, RawResult, StandardRow,
};
use crate::observability::redact_url;
use crate::query::{BinaryOp, LiteralKind};

pub(crate) const DOCUMENT_OPERATORS: &[(BinaryOp, &str)] = &[
    (BinaryOp::And, "$and"),
    (BinaryOp::Or, "$or"),
    (BinaryOp::Eq, "$eq"),
    (BinaryOp::Lt, "$lt"),
    (BinaryOp::Gt, "$gt"),
    (BinaryOp::LtEq, "$lte"),
    (BinaryOp::GtEq, "$gte"),
    (BinaryOp::Is, "$eq"),
    (BinaryOp::IsNot, "$ne"),
    (BinaryOp::In, "$in"),
    (BinaryOp::NotIn, "$nin"),
];

fn capabilities() -> CapabilityDescriptor {
    let geojson = |name, pattern| {
        FunctionPattern::new(name, pattern).map(|p| p.validated(has_geojson_literal))
    };
    CapabilityDescriptor::new(BackendKind::Document)
        .with_literals(&[
            LiteralKind::Number,
            LiteralKind::String,
            LiteralKind::Bool,
            LiteralKind::Null,
            LiteralKind::List,
        ])
        .with_operators(DOCUMENT_OPERATORS)
        .with_functions(&[("mod", patterns::MOD_EQ), ("date", patterns::DATE_EQ_LT)])
        .with_function(geojson("distance", patterns::DISTANCE))
        .with_function(geojson("distance", patterns::DISTANCE_REVERSED))
        .with_function(geojson("within", patterns::WITHIN))
        .with_function(geojson("intersects", patterns::INTERSECTS))
        .with_function(geojson("intersects", patterns::INTERSECTS_REVERSED))
}

/// MongoDB driver implementation
pub struct MongoDriver {
    config: BackendConfig,
    capabilities: CapabilityDescriptor,
    client: RwLock<Option<Client>>,
}

impl MongoDriver {
    pub fn new(config: &BackendConfig) -> EngineResult<Self> {
        Ok(Self {
            config: config.clone(),
            capabilities: capabilities(),
            client: RwLock::new(None),
        })
    }

    async fn create_client_and_ping(config: &BackendConfig) -> EngineResult<Client> {
        let mut options = ClientOptions::parse(&config.url)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        if let Some(username) = &config.username {
            options.credential = Some(
                Credential::builder()
                    .username(username.clone())
                    .password(config.password().map(str::to_string))
                    .build(),
            );
        }

        let client = Client::with_options(options)
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("Authentication failed") {
                    EngineError::auth_failed(msg)
                } else {
                    EngineError::connection_failed(msg)
                }
            })?;

        Ok(client)
    }

    async fn client(&self) -> EngineResult<Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::connection_failed("MongoDB driver is not connected"))
    }

    fn to_document(value: &serde_json::Value) -> EngineResult<Document> {
        bson::to_document(value).map_err(|e| EngineError::internal(e.to_string()))
    }

    /// Converts BSON to relaxed extended JSON.
    fn document_to_json(doc: Document) -> serde_json::Value {
        Bson::Document(doc).into_relaxed_extjson()
    }
}

/// Splits GeoJSON feature documents into the common row shape.
pub(crate) fn standardize_features(documents: Vec<serde_json::Value>) -> Vec<StandardRow> {
    documents
        .into_iter()
        .map(|mut doc| {
            let geometry = match doc.get_mut("geometry").map(serde_json::Value::take) {
                None | Some(serde_json::Value::Null) => None,
                Some(geometry) => Some(geometry.to_string()),
            };
            let properties = match doc.get_mut("properties").map(serde_json::Value::take) {
                Some(serde_json::Value::Object(map)) => map,
                _ => serde_json::Map::new(),
            };
            StandardRow {
                geometry,
                properties,
            }
        })
        .collect()
}

#[async_trait]
impl BackendDriver for MongoDriver {
    fn driver_id(&self) -> &'static str {
        "mongodb"
    }

    fn driver_name(&self) -> &'static str {
        "MongoDB"
    }

    fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    async fn connect(&self) -> EngineResult<()> {
        let client = Self::create_client_and_ping(&self.config).await?;
        *self.client.write().await = Some(client);
        tracing::info!(url = %redact_url(&self.config.url), "MongoDB: connected");
        Ok(())
    }

    fn compile(&self, request: &FetchRequest) -> EngineResult<NativeQuery> {
        DocumentCompiler::new(&self.capabilities, ProjectionStyle::Object).compile(request)
    }

    async fn fetch(&self, request: &FetchRequest) -> EngineResult<RawResult> {
        let NativeQuery::Document {
            collection,
            filter,
            projection,
        } = self.compile(request)?
        else {
            return Err(EngineError::internal("MongoDB compiled a non-document request"));
        };
        tracing::debug!(collection = %collection, filter = %filter, projection = %projection, "MongoDB: find");

        let client = self.client().await?;
        let coll = client
            .database(&self.config.database)
            .collection::<Document>(&collection);
        let projection = Self::to_document(&projection)?;
        let mut find = coll.find(Self::to_document(&filter)?);
        if !projection.is_empty() {
            find = find.projection(projection);
        }
        let mut cursor = find
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        let mut documents = Vec::new();
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?
        {
            documents.push(Self::document_to_json(doc));
        }
        Ok(RawResult::Documents(documents))
    }

    fn standardize(&self, raw: RawResult) -> EngineResult<Vec<StandardRow>> {
        match raw {
            RawResult::Documents(documents) => Ok(standardize_features(documents)),
            RawResult::Markup(_) => Err(EngineError::internal(
                "MongoDB cannot standardize XML results",
            )),
        }
    }

    fn geometry_encoding(&self, _variant: &BackendVariant) -> GeometryEncoding {
        GeometryEncoding::GeoJson
    }

    async fn list_fields(&self, collection: &str) -> EngineResult<Vec<String>> {
        let client = self.client().await?;
        let first = client
            .database(&self.config.database)
            .collection::<Document>(collection)
            .find_one(doc! {})
            .projection(doc! { "_id": 0, "properties": 1 })
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;
        Ok(first
            .and_then(|doc| doc.get_document("properties").ok().cloned())
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_collections(&self) -> EngineResult<Vec<String>> {
        let client = self.client().await?;
        let mut names = client
            .database(&self.config.database)
            .list_collection_names()
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::types::{CollectionDescriptor, CollectionScan, ColumnSet};
    use crate::query::Expr;
    use serde_json::json;

    fn driver() -> MongoDriver {
        MongoDriver::new(&BackendConfig::default()).unwrap()
    }

    #[test]
    fn filter_documents_convert_to_bson() {
        let filter = json!({"properties.city": {"$eq": "X"}, "properties.n": {"$mod": [3, 1]}});
        let doc = MongoDriver::to_document(&filter).unwrap();
        assert_eq!(
            doc.get_document("properties.city").unwrap().get_str("$eq").unwrap(),
            "X"
        );
    }

    #[test]
    fn standardizes_features() {
        let rows = standardize_features(vec![
            json!({"geometry": {"type": "Point", "coordinates": [1, 2]}, "properties": {"name": "a", "n": null}}),
            json!({"geometry": null, "properties": {"name": "b"}}),
            json!({"_id": {"$oid": "x"}}),
        ]);
        assert_eq!(
            rows[0].geometry.as_deref(),
            Some(r#"{"coordinates":[1,2],"type":"Point"}"#)
        );
        assert_eq!(rows[0].properties["n"], serde_json::Value::Null);
        assert_eq!(rows[1].geometry, None);
        assert!(rows[2].properties.is_empty());
    }

    #[test]
    fn compiles_named_projection() {
        let scan = CollectionScan {
            collection: CollectionDescriptor {
                name: "parks".into(),
                alias: "parks".into(),
                join_kind: None,
                join_condition: None,
            },
            predicate: Expr::binary(BinaryOp::Eq, Expr::column("parks", "city"), Expr::string("X")),
            columns: ColumnSet::named(["name"]),
        };
        let request = FetchRequest::single(scan, BackendVariant::default());
        let NativeQuery::Document { filter, projection, .. } = driver().compile(&request).unwrap()
        else {
            panic!("expected a document query");
        };
        assert_eq!(filter, json!({"properties.city": {"$eq": "X"}}));
        assert_eq!(projection["_id"], json!(0));
        assert_eq!(projection["geometry"], json!(1));
    }

    #[test]
    fn no_inequality_operator() {
        let caps = capabilities();
        assert!(!caps.supports_operator(BinaryOp::NotEq));
        assert_eq!(caps.translate(BinaryOp::LtEq), Some("$lte"));
        assert!(!caps.can_join);
        assert!(!caps.requires_probe);
    }

    #[tokio::test]
    async fn fetch_before_connect_fails() {
        let driver = driver();
        assert!(matches!(
            driver.list_collections().await,
            Err(EngineError::ConnectionFailed { .. })
        ));
    }
}

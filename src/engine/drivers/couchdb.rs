// SPDX-License-Identifier: BUSL-1.1

//! CouchDB Driver
//!
//! Every collection is a CouchDB database of GeoJSON feature documents,
//! queried through Mango `_find` with the document compiler's selector.

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value as Json};

use crate::config::BackendConfig;
use crate::engine::drivers::mongodb::{standardize_features, DOCUMENT_OPERATORS};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::BackendDriver;
use crate::engine::types::BackendKind;
use crate::federation::capability::{patterns, CapabilityDescriptor};
use crate::federation::compiler::{DocumentCompiler, NativeQuery, ProjectionStyle, QueryCompiler};
use crate::federation::types::{
    BackendVariant, FetchRequest, GeometryEncoding, RawResult, StandardRow,
};
use crate::query::LiteralKind;

/// `_find` page size.
pub const BATCH_SIZE: usize = 25;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn capabilities() -> CapabilityDescriptor {
    CapabilityDescriptor::new(BackendKind::Document)
        .with_literals(&[
            LiteralKind::Number,
            LiteralKind::String,
            LiteralKind::Bool,
            LiteralKind::Null,
            LiteralKind::List,
        ])
        .with_operators(DOCUMENT_OPERATORS)
        .with_functions(&[("mod", patterns::MOD_EQ)])
}

pub struct CouchDbDriver {
    http: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    capabilities: CapabilityDescriptor,
}

impl CouchDbDriver {
    pub fn new(config: &BackendConfig) -> EngineResult<Self> {
        url::Url::parse(&config.url)
            .map_err(|e| EngineError::configuration(format!("invalid backend url: {e}")))?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::configuration(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password().map(str::to_string),
            capabilities: capabilities(),
        })
    }

    fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for segment in segments {
            url.push('/');
            if segment.starts_with('_') {
                url.push_str(segment);
            } else {
                url.extend(utf8_percent_encode(segment, NON_ALPHANUMERIC));
            }
        }
        url
    }

    async fn send(&self, request: RequestBuilder) -> EngineResult<Json> {
        let request = match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        };
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout {
                    timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
                }
            } else {
                EngineError::connection_failed(e.to_string())
            }
        })?;
        let status = response.status();
        let body: Json = response
            .json()
            .await
            .map_err(|e| EngineError::execution_error(format!("invalid CouchDB response: {e}")))?;
        match status {
            s if s.is_success() => Ok(body),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(EngineError::auth_failed(couch_error(&body)))
            }
            s => Err(EngineError::execution_error(format!(
                "HTTP {s}: {}",
                couch_error(&body)
            ))),
        }
    }

    async fn find_page(&self, database: &str, mut body: Json, skip: usize) -> EngineResult<Vec<Json>> {
        body["limit"] = json!(BATCH_SIZE);
        body["skip"] = json!(skip);
        let response = self
            .send(self.http.post(self.url(&[database, "_find"])).json(&body))
            .await?;
        Ok(match response.get("docs") {
            Some(Json::Array(docs)) => docs.clone(),
            _ => Vec::new(),
        })
    }
}

fn couch_error(body: &Json) -> String {
    match (body.get("error"), body.get("reason")) {
        (Some(error), Some(reason)) => format!(
            "{}: {}",
            error.as_str().unwrap_or_default(),
            reason.as_str().unwrap_or_default()
        ),
        _ => body.to_string(),
    }
}

/// `_find` body for a compiled query. A null projection requests whole documents.
fn find_body(filter: Json, projection: Json) -> Json {
    let mut body = json!({ "selector": filter });
    if !projection.is_null() {
        body["fields"] = projection;
    }
    body
}

#[async_trait]
impl BackendDriver for CouchDbDriver {
    fn driver_id(&self) -> &'static str {
        "couchdb"
    }

    fn driver_name(&self) -> &'static str {
        "CouchDB"
    }

    fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    async fn connect(&self) -> EngineResult<()> {
        let welcome = self.send(self.http.get(self.url(&[]))).await?;
        let version = welcome
            .get("version")
            .and_then(Json::as_str)
            .unwrap_or("unknown");
        tracing::info!(version, "CouchDB: connected");
        Ok(())
    }

    fn compile(&self, request: &FetchRequest) -> EngineResult<NativeQuery> {
        DocumentCompiler::new(&self.capabilities, ProjectionStyle::FieldList).compile(request)
    }

    async fn fetch(&self, request: &FetchRequest) -> EngineResult<RawResult> {
        let NativeQuery::Document {
            collection,
            filter,
            projection,
        } = self.compile(request)?
        else {
            return Err(EngineError::internal("CouchDB compiled a non-document request"));
        };
        tracing::debug!(collection = %collection, selector = %filter, fields = %projection, "CouchDB: _find");

        let body = find_body(filter, projection);
        let mut documents = Vec::new();
        loop {
            let page = self.find_page(&collection, body.clone(), documents.len()).await?;
            if page.is_empty() {
                break;
            }
            documents.extend(page);
        }
        Ok(RawResult::Documents(documents))
    }

    fn standardize(&self, raw: RawResult) -> EngineResult<Vec<StandardRow>> {
        match raw {
            RawResult::Documents(documents) => Ok(standardize_features(documents)),
            RawResult::Markup(_) => Err(EngineError::internal(
                "CouchDB cannot standardize XML results",
            )),
        }
    }

    fn geometry_encoding(&self, _variant: &BackendVariant) -> GeometryEncoding {
        GeometryEncoding::GeoJson
    }

    async fn list_fields(&self, collection: &str) -> EngineResult<Vec<String>> {
        let body = json!({ "selector": {}, "fields": ["properties"], "limit": 1 });
        let response = self
            .send(self.http.post(self.url(&[collection, "_find"])).json(&body))
            .await?;
        Ok(response
            .pointer("/docs/0/properties")
            .and_then(Json::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_collections(&self) -> EngineResult<Vec<String>> {
        let response = self.send(self.http.get(self.url(&["_all_dbs"]))).await?;
        let names = response
            .as_array()
            .map(|dbs| {
                dbs.iter()
                    .filter_map(Json::as_str)
                    .filter(|name| !name.starts_with('_'))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{BinaryOp, Expr};

    fn driver() -> CouchDbDriver {
        CouchDbDriver::new(&BackendConfig {
            driver: "couchdb".into(),
            url: "http://localhost:5984/".into(),
            ..BackendConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn urls_encode_database_names() {
        let driver = driver();
        assert_eq!(driver.url(&["_all_dbs"]), "http://localhost:5984/_all_dbs");
        assert_eq!(
            driver.url(&["gis/parks", "_find"]),
            "http://localhost:5984/gis%2Fparks/_find"
        );
    }

    #[test]
    fn natural_projection_omits_fields() {
        assert_eq!(find_body(json!({}), Json::Null), json!({"selector": {}}));
        assert_eq!(
            find_body(json!({}), json!(["geometry", "properties.name"])),
            json!({"selector": {}, "fields": ["geometry", "properties.name"]})
        );
    }

    #[test]
    fn only_modulo_is_pushable() {
        let caps = capabilities();
        let variant = BackendVariant::default();
        let modulo = Expr::binary(
            BinaryOp::Eq,
            Expr::binary(BinaryOp::Modulo, Expr::column("t", "n"), Expr::number(2)),
            Expr::number(0),
        );
        let date = Expr::binary(
            BinaryOp::Eq,
            Expr::function("date", vec![Expr::column("t", "d")]),
            Expr::string("2020-01-01"),
        );
        assert!(caps.match_function(&modulo, &variant).is_some());
        assert!(caps.match_function(&date, &variant).is_none());
    }

    #[test]
    fn error_bodies_are_summarized() {
        assert_eq!(
            couch_error(&json!({"error": "not_found", "reason": "Database does not exist."})),
            "not_found: Database does not exist."
        );
    }
}

// SPDX-License-Identifier: BUSL-1.1

//! XML store REST client
//!
//! BaseX and eXist-db both accept an XQuery posted to their REST endpoint
//! and answer with the serialized result items. This module holds the shared
//! HTTP plumbing, the spatial namespace probe and the conversion of
//! `<result>` elements into standardized rows.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{Map, Value as Json};

use crate::config::BackendConfig;
use crate::engine::error::{EngineError, EngineResult};
use crate::federation::capability::{FunctionMatch, GEOMETRY_COLUMN};
use crate::federation::types::{SpatialFlavor, SpatialNamespace, StandardRow};
use crate::observability::Sensitive;
use crate::query::BinaryOp;

/// Operator table shared by the XQuery backends.
pub const XML_OPERATORS: &[(BinaryOp, &str)] = &[
    (BinaryOp::And, "and"),
    (BinaryOp::Or, "or"),
    (BinaryOp::Eq, "="),
    (BinaryOp::NotEq, "!="),
    (BinaryOp::Lt, "<"),
    (BinaryOp::LtEq, "<="),
    (BinaryOp::Gt, ">"),
    (BinaryOp::GtEq, ">="),
    (BinaryOp::Is, "is"),
    (BinaryOp::IsNot, "is not"),
    (BinaryOp::In, "="),
    (BinaryOp::NotIn, "!="),
];

pub const PROBE_FAILED_MESSAGE: &str =
    "no spatial namespace found in the collection or extension type is not valid";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// REST protocol flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestDialect {
    BaseX,
    Exist,
}

impl RestDialect {
    fn endpoint(&self, base: &str) -> String {
        let base = base.trim_end_matches('/');
        match self {
            RestDialect::BaseX => format!("{base}/rest"),
            RestDialect::Exist => format!("{base}/rest/db"),
        }
    }

    fn body(&self, xquery: &str) -> String {
        let text = xml_escape(xquery);
        match self {
            RestDialect::BaseX => {
                format!("<query xmlns=\"http://basex.org/rest\"><text>{text}</text></query>")
            }
            RestDialect::Exist => format!(
                "<query xmlns=\"http://exist.sourceforge.net/NS/exist\" start=\"1\" max=\"2147483647\" wrap=\"no\" cache=\"no\"><text>{text}</text></query>"
            ),
        }
    }
}

pub struct XmlRestClient {
    http: Client,
    endpoint: String,
    username: Option<String>,
    password: Option<Sensitive<String>>,
    dialect: RestDialect,
}

impl XmlRestClient {
    pub fn new(config: &BackendConfig, dialect: RestDialect) -> EngineResult<Self> {
        url::Url::parse(&config.url)
            .map_err(|e| EngineError::configuration(format!("invalid backend url: {e}")))?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::configuration(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: dialect.endpoint(&config.url),
            username: config.username.clone(),
            password: config.password.clone(),
            dialect,
        })
    }

    /// Posts `xquery` and returns the serialized result items.
    pub async fn query(&self, xquery: &str) -> EngineResult<String> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/xml")
            .body(self.dialect.body(xquery));
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref().map(|p| p.expose()));
        }

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
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;
        match status {
            s if s.is_success() => Ok(body),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(EngineError::auth_failed(body)),
            s => Err(EngineError::execution_error(format!("HTTP {s}: {}", body.trim()))),
        }
    }
}

/// Escapes text for an XML element body.
pub fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Major component of a dotted version string.
pub fn major_version(version: &str) -> Option<u32> {
    version.trim().split('.').next()?.trim().parse().ok()
}

/// Discovers which spatial prefix the collection's documents bind.
///
/// Yields `<gml>uri</gml>` or `<kml>uri</kml>` items; the first wins. A
/// document whose root element is named after the flavor in the default
/// namespace (plain KML files) counts as well.
pub fn probe_query(source: &str) -> String {
    let flavors = [SpatialFlavor::Gml, SpatialFlavor::Kml]
        .iter()
        .map(|f| format!("'{}'", f.prefix()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "let $root := ({source}/*)[1]\n\
         for $p in ({flavors})\n\
         let $ns := if (exists($root)) then namespace-uri-for-prefix($p, $root) else ()\n\
         return if (exists($ns)) then element {{$p}} {{$ns}}\n\
         else if (exists($root) and local-name($root) = $p) then element {{$p}} {{namespace-uri($root)}}\n\
         else ()"
    )
}

/// Wraps a response body so a sequence of items parses as one document.
fn wrap(body: &str) -> String {
    let mut body = body.trim_start();
    while let Some(rest) = body.strip_prefix("<?xml") {
        body = rest.split_once("?>").map(|(_, tail)| tail).unwrap_or("").trim_start();
    }
    format!("<geofed>{body}</geofed>")
}

fn parse_error(e: roxmltree::Error) -> EngineError {
    EngineError::execution_error(format!("malformed XML response: {e}"))
}

fn text_of(node: roxmltree::Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

pub fn parse_probe(body: &str) -> EngineResult<Option<SpatialNamespace>> {
    let wrapped = wrap(body);
    let doc = roxmltree::Document::parse(&wrapped).map_err(parse_error)?;
    Ok(doc
        .root_element()
        .children()
        .filter(|n| n.is_element())
        .find_map(|n| {
            let flavor = SpatialFlavor::from_prefix(n.tag_name().name())?;
            let uri = text_of(n);
            (!uri.trim().is_empty()).then(|| SpatialNamespace {
                flavor,
                uri: uri.trim().to_string(),
            })
        }))
}

/// Whole text content of a response, e.g. a version string.
pub fn parse_text(body: &str) -> EngineResult<String> {
    let wrapped = wrap(body);
    let doc = roxmltree::Document::parse(&wrapped).map_err(parse_error)?;
    Ok(text_of(doc.root_element()).trim().to_string())
}

/// Text of every top-level element, for `element r {..}` listings.
pub fn parse_names(body: &str) -> EngineResult<Vec<String>> {
    let wrapped = wrap(body);
    let doc = roxmltree::Document::parse(&wrapped).map_err(parse_error)?;
    Ok(doc
        .root_element()
        .children()
        .filter(|n| n.is_element())
        .map(text_of)
        .collect())
}

/// Converts `<result>` elements into rows.
///
/// The `geometry` child becomes the row geometry. Every other child becomes
/// a property: empty text is null, integers and finite decimals are numbers
/// and anything else stays a string. The first element of a name wins.
pub fn standardize_markup(chunks: &[String]) -> EngineResult<Vec<StandardRow>> {
    let mut rows = Vec::new();
    for chunk in chunks {
        let wrapped = wrap(chunk);
        let doc = roxmltree::Document::parse(&wrapped).map_err(parse_error)?;
        for result in doc
            .root_element()
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "result")
        {
            let mut row = StandardRow::default();
            let mut properties = Map::new();
            for field in result.children().filter(|n| n.is_element()) {
                let name = field.tag_name().name();
                let text = text_of(field);
                if name == GEOMETRY_COLUMN {
                    if row.geometry.is_none() && !text.trim().is_empty() {
                        row.geometry = Some(text.trim().to_string());
                    }
                    continue;
                }
                properties
                    .entry(name.to_string())
                    .or_insert_with(|| typed_value(&text));
            }
            row.properties = properties;
            rows.push(row);
        }
    }
    Ok(rows)
}

fn typed_value(text: &str) -> Json {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Json::Null;
    }
    // Codes such as "007" keep their leading zeros.
    let leading_zero = trimmed.len() > 1
        && trimmed.trim_start_matches('-').starts_with('0')
        && !trimmed.trim_start_matches('-').starts_with("0.");
    if !leading_zero {
        if let Ok(n) = trimmed.parse::<i64>() {
            return Json::from(n);
        }
        if let Some(n) = trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
        {
            return Json::Number(n);
        }
    }
    Json::String(text.to_string())
}

/// Accepts matches whose geometry literal is XML markup.
pub fn has_markup_literal(found: &FunctionMatch) -> bool {
    found
        .text(0)
        .map(|t| t.trim_start().starts_with('<'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_query_text() {
        assert_eq!(
            xml_escape("for $f in x where $f < 3 and 'a' = 'a&b' return <r/>"),
            "for $f in x where $f &lt; 3 and 'a' = 'a&amp;b' return &lt;r/&gt;"
        );
    }

    #[test]
    fn endpoints_per_dialect() {
        assert_eq!(
            RestDialect::BaseX.endpoint("http://localhost:8080/"),
            "http://localhost:8080/rest"
        );
        assert_eq!(
            RestDialect::Exist.endpoint("http://localhost:8080/exist"),
            "http://localhost:8080/exist/rest/db"
        );
    }

    #[test]
    fn exist_body_disables_wrapping_and_paging() {
        let body = RestDialect::Exist.body("1");
        assert!(body.contains("wrap=\"no\""));
        assert!(body.contains("max=\"2147483647\""));
    }

    #[test]
    fn major_versions() {
        assert_eq!(major_version("9.7.3"), Some(9));
        assert_eq!(major_version("10.7"), Some(10));
        assert_eq!(major_version(" 6.2.0 "), Some(6));
        assert_eq!(major_version("beta"), None);
    }

    #[test]
    fn probe_picks_first_namespace() {
        let ns = parse_probe("<gml>http://www.opengis.net/gml</gml>").unwrap();
        assert_eq!(
            ns,
            Some(SpatialNamespace {
                flavor: SpatialFlavor::Gml,
                uri: "http://www.opengis.net/gml".into()
            })
        );
        assert_eq!(parse_probe("").unwrap(), None);
        assert_eq!(parse_probe("<svg>http://x</svg>").unwrap(), None);
    }

    #[test]
    fn probe_query_reads_source_root() {
        let q = probe_query("db:get('gis', 'roads')");
        assert!(q.starts_with("let $root := (db:get('gis', 'roads')/*)[1]"));
        assert!(q.contains("for $p in ('gml', 'kml')"));
    }

    #[test]
    fn text_and_names() {
        assert_eq!(parse_text("<?xml version=\"1.0\"?>9.7.3\n").unwrap(), "9.7.3");
        assert_eq!(
            parse_names("<r>roads</r>\n<r>parks</r>").unwrap(),
            vec!["roads".to_string(), "parks".to_string()]
        );
    }

    #[test]
    fn standardizes_result_elements() {
        let body = "<result><name>O'Brien &amp; Co</name><area>12.5</area><code>007</code>\
                    <count>3</count><note/><name>second</name>\
                    <geometry>POINT (1 2)</geometry></result>\n<result><geometry/></result>";
        let rows = standardize_markup(&[body.to_string()]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].geometry.as_deref(), Some("POINT (1 2)"));
        assert_eq!(rows[0].properties["name"], Json::from("O'Brien & Co"));
        assert_eq!(rows[0].properties["area"], Json::from(12.5));
        assert_eq!(rows[0].properties["code"], Json::from("007"));
        assert_eq!(rows[0].properties["count"], Json::from(3));
        assert_eq!(rows[0].properties["note"], Json::Null);
        assert_eq!(rows[1].geometry, None);
        assert!(rows[1].properties.is_empty());
    }

    #[test]
    fn empty_group_key_is_a_null_group() {
        let body = "<result><kind>oak</kind><_func__count__all>2</_func__count__all></result>\n\
                    <result><kind/><_func__count__all>1</_func__count__all></result>";
        let rows = standardize_markup(&[body.to_string()]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].properties["kind"], Json::from("oak"));
        assert_eq!(rows[1].properties["kind"], Json::Null);
        assert_eq!(rows[1].properties["_func__count__all"], Json::from(1));
    }

    #[test]
    fn serialized_markup_geometry_is_kept_as_text() {
        let body = "<result><geometry>&lt;gml:Point xmlns:gml=\"u\"&gt;&lt;gml:pos&gt;1 2&lt;/gml:pos&gt;&lt;/gml:Point&gt;</geometry></result>";
        let rows = standardize_markup(&[body.to_string()]).unwrap();
        assert_eq!(
            rows[0].geometry.as_deref(),
            Some("<gml:Point xmlns:gml=\"u\"><gml:pos>1 2</gml:pos></gml:Point>")
        );
    }

    #[test]
    fn malformed_markup_is_an_execution_error() {
        let err = standardize_markup(&["<result><a></result>".to_string()]).unwrap_err();
        assert!(matches!(err, EngineError::ExecutionError { .. }));
    }
}

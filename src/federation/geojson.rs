// SPDX-License-Identifier: BUSL-1.1

//! GeoJSON output for results that carry a serialized geometry column.

use serde_json::{json, Map, Value as Json};

use crate::engine::types::{QueryResult, Value};

/// Name of the column holding GeoJSON geometries.
pub const GEOJSON_COLUMN: &str = "st_asgeojson";

/// Index of the GeoJSON column. DuckDB names an unaliased call after its
/// full text, so `st_asgeojson(...)` matches too.
fn geojson_column(result: &QueryResult) -> Option<usize> {
    result.columns.iter().position(|c| {
        let name = c.name.to_ascii_lowercase();
        name == GEOJSON_COLUMN || name.starts_with(&format!("{GEOJSON_COLUMN}("))
    })
}

fn parse_geometry(value: &Value) -> Json {
    match value {
        Value::Text(text) => serde_json::from_str(text).unwrap_or(Json::Null),
        Value::Json(json @ Json::Object(_)) => json.clone(),
        Value::Json(Json::String(text)) => serde_json::from_str(text).unwrap_or(Json::Null),
        _ => Json::Null,
    }
}

/// Builds a `FeatureCollection`, or `None` when the result has no GeoJSON
/// column.
pub fn to_feature_collection(result: &QueryResult) -> Option<Json> {
    let geometry_idx = geojson_column(result)?;
    let features: Vec<Json> = result
        .rows
        .iter()
        .map(|row| {
            let geometry = row
                .values
                .get(geometry_idx)
                .map(parse_geometry)
                .unwrap_or(Json::Null);
            let properties: Map<String, Json> = result
                .columns
                .iter()
                .zip(&row.values)
                .enumerate()
                .filter(|(idx, _)| *idx != geometry_idx)
                .map(|(_, (col, value))| (col.name.clone(), value.to_json()))
                .collect();
            json!({
                "type": "Feature",
                "geometry": geometry,
                "properties": properties,
            })
        })
        .collect();

    Some(json!({
        "type": "FeatureCollection",
        "features": features,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{ColumnInfo, Row};

    fn column(name: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            data_type: "VARCHAR".into(),
            nullable: true,
        }
    }

    #[test]
    fn rows_become_features() {
        let result = QueryResult {
            columns: vec![column("name"), column("ST_AsGeoJSON")],
            rows: vec![
                Row {
                    values: vec![
                        Value::Text("a".into()),
                        Value::Text(r#"{"type":"Point","coordinates":[1,2]}"#.into()),
                    ],
                },
                Row {
                    values: vec![Value::Text("b".into()), Value::Text("not json".into())],
                },
            ],
            execution_time_ms: 0.0,
        };
        let collection = to_feature_collection(&result).unwrap();
        assert_eq!(collection["type"], "FeatureCollection");
        let features = collection["features"].as_array().unwrap();
        assert_eq!(features[0]["geometry"]["type"], "Point");
        assert_eq!(features[0]["properties"], json!({"name": "a"}));
        assert_eq!(features[1]["geometry"], Json::Null);
    }

    #[test]
    fn duckdb_call_names_match() {
        let result = QueryResult {
            columns: vec![column("st_asgeojson(t.geometry)")],
            rows: Vec::new(),
            execution_time_ms: 0.0,
        };
        assert!(to_feature_collection(&result).is_some());
    }

    #[test]
    fn absent_column_yields_none() {
        let result = QueryResult {
            columns: vec![column("name")],
            rows: Vec::new(),
            execution_time_ms: 0.0,
        };
        assert!(to_feature_collection(&result).is_none());
    }
}

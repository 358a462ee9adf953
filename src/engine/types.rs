// SPDX-License-Identifier: BUSL-1.1

//! Universal data types for the federation engine
//!
//! These types carry relational results back to the caller in one shape,
//! regardless of which relational engine produced them.

use serde::{Deserialize, Serialize};

/// Kind of backend family a driver belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// JSON document stores filtered with `$`-operators
    Document,
    /// XML stores queried with XQuery
    Xml,
}

/// Driver metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverInfo {
    pub id: String,
    pub name: String,
    pub kind: BackendKind,
    pub can_join: bool,
    pub requires_probe: bool,
}

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

impl Value {
    /// JSON form used for GeoJSON properties and CLI output.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(bytes) => {
                use base64::{engine::general_purpose::STANDARD, Engine};
                serde_json::Value::String(STANDARD.encode(bytes))
            }
            Value::Json(v) => v.clone(),
            Value::Array(values) => {
                serde_json::Value::Array(values.iter().map(Value::to_json).collect())
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use base64::{Engine, engine::general_purpose::STANDARD};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Column metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// A single row of data (indexed by column order)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

/// Relational engine result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column information
    pub columns: Vec<ColumnInfo>,
    /// Result rows
    pub rows: Vec<Row>,
    /// Execution time in milliseconds
    pub execution_time_ms: f64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            execution_time_ms: 0.0,
        }
    }

    /// Index of the column named `name`, compared case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_json_rows(&self) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .map(|row| {
                let object: serde_json::Map<String, serde_json::Value> = self
                    .columns
                    .iter()
                    .zip(&row.values)
                    .map(|(col, value)| (col.name.clone(), value.to_json()))
                    .collect();
                serde_json::Value::Object(object)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_serialize_untagged() {
        let json = serde_json::to_value(vec![
            Value::Null,
            Value::Int(3),
            Value::Text("a".into()),
            Value::Bytes(vec![1, 2]),
        ])
        .unwrap();
        assert_eq!(json, serde_json::json!([null, 3, "a", "AQI="]));
    }

    #[test]
    fn json_rows_keep_column_names() {
        let result = QueryResult {
            columns: vec![
                ColumnInfo {
                    name: "name".into(),
                    data_type: "VARCHAR".into(),
                    nullable: true,
                },
                ColumnInfo {
                    name: "area".into(),
                    data_type: "DOUBLE".into(),
                    nullable: true,
                },
            ],
            rows: vec![Row {
                values: vec![Value::Text("park".into()), Value::Float(1.5)],
            }],
            execution_time_ms: 0.0,
        };
        assert_eq!(
            result.to_json_rows(),
            vec![serde_json::json!({"name": "park", "area": 1.5})]
        );
        assert_eq!(result.column_index("AREA"), Some(1));
    }
}

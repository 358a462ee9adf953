// SPDX-License-Identifier: BUSL-1.1

//! DuckDB in-memory relational engine.
//!
//! Every rebuilt query runs on a fresh in-memory connection. Fetched rows are
//! already inlined into the SQL text as VALUES tables, so nothing is loaded
//! beforehand and the connection is dropped with the result.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use duckdb::types::{TimeUnit, Value as DuckValue};
use duckdb::Connection;
use rust_decimal::prelude::ToPrimitive;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::RelationalEngine;
use crate::engine::types::{ColumnInfo, QueryResult, Row, Value};
use crate::federation::types::GeometryEncoding;

/// Days between 0001-01-01 and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

pub struct DuckDbEngine {
    spatial: bool,
}

impl DuckDbEngine {
    /// `spatial` installs and loads the DuckDB spatial extension on every
    /// connection, enabling geometry parsing of fetched rows.
    pub fn new(spatial: bool) -> Self {
        Self { spatial }
    }

    fn open(spatial: bool) -> EngineResult<Connection> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::internal(format!("Failed to open DuckDB: {e}")))?;
        if spatial {
            conn.execute_batch("INSTALL spatial; LOAD spatial;")
                .map_err(|e| {
                    EngineError::configuration(format!("Failed to load DuckDB spatial: {e}"))
                })?;
        }
        Ok(conn)
    }

    /// Runs `sql` on `conn` and collects every row.
    pub fn execute_query(conn: &Connection, sql: &str) -> EngineResult<QueryResult> {
        let start = Instant::now();

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| EngineError::execution_error(format!("Federation query failed: {e}")))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| EngineError::execution_error(format!("Federation query failed: {e}")))?;

        let names: Vec<String> = rows
            .as_ref()
            .map(|s| s.column_names())
            .unwrap_or_default();

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| EngineError::execution_error(format!("Row fetch failed: {e}")))?
        {
            let values = (0..names.len())
                .map(|i| {
                    row.get::<_, DuckValue>(i)
                        .map(duckdb_value_to_value)
                        .unwrap_or(Value::Null)
                })
                .collect();
            out.push(Row { values });
        }

        let columns = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| ColumnInfo {
                name,
                data_type: column_type(&out, i).to_string(),
                nullable: true,
            })
            .collect();

        Ok(QueryResult {
            columns,
            rows: out,
            execution_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

impl Default for DuckDbEngine {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl RelationalEngine for DuckDbEngine {
    fn engine_id(&self) -> &'static str {
        "duckdb"
    }

    async fn execute(&self, sql: &str) -> EngineResult<QueryResult> {
        let sql = sql.to_string();
        let spatial = self.spatial;
        tokio::task::spawn_blocking(move || {
            let conn = Self::open(spatial)?;
            Self::execute_query(&conn, &sql)
        })
        .await
        .map_err(|e| EngineError::internal(format!("DuckDB task failed: {e}")))?
    }

    fn geometry_parser(&self, encoding: GeometryEncoding) -> Option<&'static str> {
        if !self.spatial {
            return None;
        }
        match encoding {
            GeometryEncoding::GeoJson => Some("ST_GeomFromGeoJSON"),
            GeometryEncoding::Wkt => Some("ST_GeomFromText"),
            GeometryEncoding::Gml | GeometryEncoding::Kml => None,
        }
    }
}

/// Type name of the first non-null value in column `idx`.
fn column_type(rows: &[Row], idx: usize) -> &'static str {
    rows.iter()
        .filter_map(|r| r.values.get(idx))
        .find(|v| !v.is_null())
        .map(|v| match v {
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "BIGINT",
            Value::Float(_) => "DOUBLE",
            Value::Bytes(_) => "BLOB",
            Value::Array(_) => "LIST",
            Value::Json(_) => "JSON",
            Value::Text(_) | Value::Null => "VARCHAR",
        })
        .unwrap_or("VARCHAR")
}

fn timestamp_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

/// Converts a DuckDB value to the shared `Value`.
fn duckdb_value_to_value(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::Int(i.into()),
        DuckValue::SmallInt(i) => Value::Int(i.into()),
        DuckValue::Int(i) => Value::Int(i.into()),
        DuckValue::BigInt(i) => Value::Int(i),
        DuckValue::UTinyInt(i) => Value::Int(i.into()),
        DuckValue::USmallInt(i) => Value::Int(i.into()),
        DuckValue::UInt(i) => Value::Int(i.into()),
        DuckValue::UBigInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or(Value::Float(i as f64)),
        DuckValue::HugeInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or(Value::Float(i as f64)),
        DuckValue::Float(f) => Value::Float(f.into()),
        DuckValue::Double(f) => Value::Float(f),
        DuckValue::Decimal(d) => d.to_f64().map(Value::Float).unwrap_or(Value::Null),
        DuckValue::Text(s) | DuckValue::Enum(s) => Value::Text(s),
        DuckValue::Blob(b) => Value::Bytes(b),
        DuckValue::Date32(days) => NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
            .map(|d| Value::Text(d.to_string()))
            .unwrap_or(Value::Null),
        DuckValue::Timestamp(unit, value) => DateTime::from_timestamp_micros(timestamp_micros(unit, value))
            .map(|t| Value::Text(t.naive_utc().to_string()))
            .unwrap_or(Value::Null),
        DuckValue::List(items) => Value::Array(items.into_iter().map(duckdb_value_to_value).collect()),
        other => Value::Text(format!("{other:?}")),
    }
}

// SPDX-License-Identifier: BUSL-1.1

//! Runtime configuration.
//!
//! Loaded from `GEOFED_*` environment variables or from a JSON file. Every
//! section has defaults so a partial file is accepted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::observability::Sensitive;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub backend: BackendConfig,
    pub relational: RelationalConfig,
    pub logging: LoggingConfig,
    /// Convert results carrying an `st_asgeojson` column to a FeatureCollection
    pub geojson: bool,
}

/// Connection settings of the non-relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `mongodb`, `couchdb`, `basex` or `existdb`
    pub driver: String,
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<Sensitive<String>>,
    /// Skips version detection when set
    pub version: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            driver: "mongodb".to_string(),
            url: default_url("mongodb").to_string(),
            database: "test".to_string(),
            username: None,
            password: None,
            version: None,
        }
    }
}

impl BackendConfig {
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose().as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationalKind {
    #[default]
    DuckDb,
    Postgis,
}

impl std::str::FromStr for RelationalKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "duckdb" => Ok(RelationalKind::DuckDb),
            "postgis" | "postgres" | "postgresql" => Ok(RelationalKind::Postgis),
            other => Err(EngineError::configuration(format!(
                "unknown relational engine '{other}'"
            ))),
        }
    }
}

/// Settings of the engine that executes rebuilt queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalConfig {
    pub engine: RelationalKind,
    /// Connection URL, required for PostGIS
    pub url: Option<Sensitive<String>>,
    /// Load the DuckDB spatial extension on every connection
    pub duckdb_spatial: bool,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            engine: RelationalKind::DuckDb,
            url: None,
            duckdb_spatial: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    pub filter: String,
    pub json: bool,
    /// Daily rolling log files are written here when set
    pub directory: Option<PathBuf>,
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "geofed=info".to_string(),
            json: false,
            directory: None,
            retention_days: 14,
        }
    }
}

/// Conventional endpoint of each driver's server.
pub fn default_url(driver: &str) -> &'static str {
    match driver {
        "couchdb" => "http://localhost:5984",
        "basex" => "http://localhost:8080",
        "existdb" => "http://localhost:8080/exist",
        _ => "mongodb://localhost:27017",
    }
}

impl FederationConfig {
    /// Reads `GEOFED_*` variables, falling back to defaults.
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str| get(key).map(|v| parse_bool(&v)).unwrap_or(false);

        let driver = get("GEOFED_DRIVER").unwrap_or_else(|| "mongodb".to_string());
        let backend = BackendConfig {
            url: get("GEOFED_URL").unwrap_or_else(|| default_url(&driver).to_string()),
            database: get("GEOFED_DATABASE").unwrap_or_else(|| "test".to_string()),
            username: get("GEOFED_USERNAME"),
            password: get("GEOFED_PASSWORD").map(Sensitive::new),
            version: get("GEOFED_BACKEND_VERSION"),
            driver,
        };

        let relational = RelationalConfig {
            engine: match get("GEOFED_RELATIONAL") {
                Some(kind) => kind.parse()?,
                None => RelationalKind::DuckDb,
            },
            url: get("GEOFED_RELATIONAL_URL").map(Sensitive::new),
            duckdb_spatial: flag("GEOFED_DUCKDB_SPATIAL"),
        };

        let logging = LoggingConfig {
            json: flag("GEOFED_LOG_JSON"),
            directory: get("GEOFED_LOG_DIR").map(PathBuf::from),
            ..LoggingConfig::default()
        };

        let config = Self {
            backend,
            relational,
            logging,
            geojson: flag("GEOFED_GEOJSON"),
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::configuration(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            EngineError::configuration(format!("Invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.relational.engine == RelationalKind::Postgis && self.relational.url.is_none() {
            return Err(EngineError::configuration(
                "the postgis engine needs GEOFED_RELATIONAL_URL",
            ));
        }
        if self.backend.database.trim().is_empty() {
            return Err(EngineError::configuration("database name is empty"));
        }
        Ok(())
    }
}

/// `1`, `true`, `yes` and `on` are true; everything else is false.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = FederationConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.backend.driver, "mongodb");
        assert_eq!(config.backend.url, "mongodb://localhost:27017");
        assert_eq!(config.relational.engine, RelationalKind::DuckDb);
        assert!(!config.geojson);
        assert_eq!(config.logging.filter, "geofed=info");
    }

    #[test]
    fn driver_selects_default_url() {
        let config =
            FederationConfig::from_lookup(lookup(&[("GEOFED_DRIVER", "basex")])).unwrap();
        assert_eq!(config.backend.url, "http://localhost:8080");
    }

    #[test]
    fn booleans_accept_common_spellings() {
        for truthy in ["1", "true", "YES", "on"] {
            assert!(parse_bool(truthy), "{truthy}");
        }
        for falsy in ["0", "false", "off", "nope"] {
            assert!(!parse_bool(falsy), "{falsy}");
        }
    }

    #[test]
    fn postgis_requires_url() {
        let err = FederationConfig::from_lookup(lookup(&[("GEOFED_RELATIONAL", "postgis")]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));

        let config = FederationConfig::from_lookup(lookup(&[
            ("GEOFED_RELATIONAL", "postgis"),
            ("GEOFED_RELATIONAL_URL", "postgres://localhost/gis"),
        ]))
        .unwrap();
        assert_eq!(config.relational.engine, RelationalKind::Postgis);
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let config =
            FederationConfig::from_lookup(lookup(&[("GEOFED_PASSWORD", "hunter2")])).unwrap();
        assert_eq!(config.backend.password(), Some("hunter2"));
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn loads_partial_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geofed.json");
        std::fs::write(
            &path,
            r#"{"backend": {"driver": "existdb", "database": "gis"}, "geojson": true}"#,
        )
        .unwrap();
        let config = FederationConfig::from_file(&path).unwrap();
        assert_eq!(config.backend.driver, "existdb");
        assert_eq!(config.backend.database, "gis");
        assert!(config.geojson);
        assert_eq!(config.relational.engine, RelationalKind::DuckDb);
    }
}

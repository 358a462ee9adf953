// SPDX-License-Identifier: BUSL-1.1

//! Driver Registry
//!
//! Maps driver ids to constructors so the configured backend can be picked
//! at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::BackendConfig;
use crate::engine::drivers::{
    basex::BaseXDriver, couchdb::CouchDbDriver, existdb::ExistDbDriver, mongodb::MongoDriver,
};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::BackendDriver;

/// Builds a driver instance from backend configuration.
pub type DriverFactory = fn(&BackendConfig) -> EngineResult<Arc<dyn BackendDriver>>;

/// Registry that holds all available driver constructors
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every driver shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("mongodb", |config| Ok(Arc::new(MongoDriver::new(config)?)));
        registry.register("couchdb", |config| Ok(Arc::new(CouchDbDriver::new(config)?)));
        registry.register("basex", |config| Ok(Arc::new(BaseXDriver::new(config)?)));
        registry.register("existdb", |config| Ok(Arc::new(ExistDbDriver::new(config)?)));
        registry
    }

    /// Registers a constructor under `driver_id`, replacing any previous one.
    pub fn register(&mut self, driver_id: impl Into<String>, factory: DriverFactory) {
        self.factories.insert(driver_id.into(), factory);
    }

    /// Builds the driver registered under `driver_id`.
    pub fn create(
        &self,
        driver_id: &str,
        config: &BackendConfig,
    ) -> EngineResult<Arc<dyn BackendDriver>> {
        let factory = self
            .factories
            .get(driver_id)
            .ok_or_else(|| EngineError::driver_not_found(driver_id))?;
        factory(config)
    }

    /// Lists all registered driver IDs, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the number of registered drivers
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns true if no drivers are registered
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_factory(_config: &BackendConfig) -> EngineResult<Arc<dyn BackendDriver>> {
        Err(EngineError::configuration("no backend"))
    }

    #[test]
    fn test_registry_basics() {
        let mut registry = DriverRegistry::new();
        assert!(registry.is_empty());

        registry.register("mock", failing_factory);
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
        assert_eq!(registry.list(), vec!["mock"]);
    }

    #[test]
    fn builtin_drivers_are_registered() {
        let registry = DriverRegistry::with_builtin();
        assert_eq!(registry.list(), vec!["basex", "couchdb", "existdb", "mongodb"]);
    }

    #[test]
    fn unknown_driver_is_reported() {
        let registry = DriverRegistry::with_builtin();
        let err = registry
            .create("oracle", &BackendConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::DriverNotFound { .. }));
    }

    #[test]
    fn factory_errors_propagate() {
        let mut registry = DriverRegistry::new();
        registry.register("mock", failing_factory);
        assert!(matches!(
            registry.create("mock", &BackendConfig::default()),
            Err(EngineError::Configuration { .. })
        ));
    }
}

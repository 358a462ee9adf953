// SPDX-License-Identifier: BUSL-1.1

//! Driver contracts
//!
//! `BackendDriver` is the seam between the generic federation core and a
//! concrete store. The core only sees the static capability descriptor and
//! the fetch/standardize calls; everything store-specific stays behind it.
//! `RelationalEngine` runs the rebuilt query.

use async_trait::async_trait;

use crate::engine::error::EngineResult;
use crate::engine::types::{DriverInfo, QueryResult};
use crate::federation::capability::CapabilityDescriptor;
use crate::federation::compiler::NativeQuery;
use crate::federation::types::{
    BackendVariant, FetchRequest, GeometryEncoding, RawResult, StandardRow,
};

/// Core trait that all backend drivers must implement
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Returns the unique identifier for this driver (e.g., "mongodb", "basex")
    fn driver_id(&self) -> &'static str;

    /// Returns a human-readable name for this driver
    fn driver_name(&self) -> &'static str;

    /// Static capability descriptor. Never mutated by the core.
    fn capabilities(&self) -> &CapabilityDescriptor;

    /// Establishes the client and resolves the backend version.
    ///
    /// Fails with `UnsupportedVersion` when the detected version has no entry
    /// in the driver's version table.
    async fn connect(&self) -> EngineResult<()>;

    /// One-time discovery query run before anything is compiled for a query.
    ///
    /// Only called when `capabilities().requires_probe` is set.
    async fn probe(&self, _collection: &str) -> EngineResult<BackendVariant> {
        Ok(BackendVariant::default())
    }

    /// Lowers a fetch request into the backend's native query.
    fn compile(&self, request: &FetchRequest) -> EngineResult<NativeQuery>;

    /// Runs the native query for `request` and returns the raw backend output.
    async fn fetch(&self, request: &FetchRequest) -> EngineResult<RawResult>;

    /// Normalizes raw output into the common row shape, preserving order.
    fn standardize(&self, raw: RawResult) -> EngineResult<Vec<StandardRow>>;

    /// Encoding of `StandardRow::geometry` for the given variant.
    fn geometry_encoding(&self, variant: &BackendVariant) -> GeometryEncoding;

    /// Field names of one stored record of `collection`.
    async fn list_fields(&self, collection: &str) -> EngineResult<Vec<String>>;

    /// Names of every collection the configured database holds.
    async fn list_collections(&self) -> EngineResult<Vec<String>>;

    fn info(&self) -> DriverInfo {
        let caps = self.capabilities();
        DriverInfo {
            id: self.driver_id().to_string(),
            name: self.driver_name().to_string(),
            kind: caps.backend_kind,
            can_join: caps.can_join,
            requires_probe: caps.requires_probe,
        }
    }
}

/// The relational engine that completes a federated query.
#[async_trait]
pub trait RelationalEngine: Send + Sync {
    fn engine_id(&self) -> &'static str;

    /// Executes a read-only query and returns every row.
    async fn execute(&self, sql: &str) -> EngineResult<QueryResult>;

    /// SQL function that parses geometries of `encoding`, if the engine has one.
    ///
    /// When `None`, rebuilt geometry columns carry the serialized text as is.
    fn geometry_parser(&self, _encoding: GeometryEncoding) -> Option<&'static str> {
        None
    }
}

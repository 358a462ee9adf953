// SPDX-License-Identifier: BUSL-1.1

// geofed - spatial query federation over document and XML stores
// Core library

pub mod config;
pub mod engine;
pub mod federation;
pub mod observability;
pub mod query;

pub use config::FederationConfig;
pub use engine::{BackendDriver, DriverRegistry, EngineError, EngineResult, RelationalEngine};
pub use federation::{FederatedQuery, FederatedResult};

// SPDX-License-Identifier: BUSL-1.1

// Data Engine Module
// Driver contract, registry and the backend drivers

pub mod drivers;
pub mod error;
pub mod registry;
pub mod traits;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use registry::DriverRegistry;
pub use traits::{BackendDriver, RelationalEngine};
pub use types::*;

// SPDX-License-Identifier: BUSL-1.1

//! Normalized error types for the federation engine
//!
//! Backend drivers, compilers and the relational engine all map their
//! failures onto these variants so callers only deal with one error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all federation operations
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Query syntax error: {message}")]
    SyntaxError { message: String },

    #[error("Query execution error: {message}")]
    ExecutionError { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Driver not found: {driver_id}")]
    DriverNotFound { driver_id: String },

    #[error("unsupported backend version: {version} ({backend})")]
    UnsupportedVersion { backend: String, version: String },

    #[error("Probe of '{collection}' failed: {message}")]
    ProbeFailed { collection: String, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Feature not supported: {message}")]
    NotSupported { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

impl EngineError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed { message: msg.into() }
    }

    pub fn syntax_error(msg: impl Into<String>) -> Self {
        Self::SyntaxError { message: msg.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn driver_not_found(id: impl Into<String>) -> Self {
        Self::DriverNotFound { driver_id: id.into() }
    }

    pub fn unsupported_version(backend: impl Into<String>, version: impl Into<String>) -> Self {
        Self::UnsupportedVersion {
            backend: backend.into(),
            version: version.into(),
        }
    }

    pub fn probe_failed(collection: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ProbeFailed {
            collection: collection.into(),
            message: msg.into(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported { message: msg.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError { message: msg.into() }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = EngineError::unsupported_version("BaseX", "6.7");
        assert_eq!(err.to_string(), "unsupported backend version: 6.7 (BaseX)");

        let err = EngineError::probe_failed("roads", "no spatial namespace found");
        assert_eq!(
            err.to_string(),
            "Probe of 'roads' failed: no spatial namespace found"
        );
    }

    #[test]
    fn errors_serialize_with_variant_tag() {
        let json = serde_json::to_value(EngineError::syntax_error("bad")).unwrap();
        assert_eq!(json["SyntaxError"]["message"], "bad");
    }
}

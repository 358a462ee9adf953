// SPDX-License-Identifier: BUSL-1.1

//! Query federation pipeline
//!
//! Splits a SELECT between a non-relational backend and a relational engine:
//! predicates the backend understands are compiled into its native query
//! language, the fetched rows are inlined into the original query, and the
//! relational engine evaluates the rest.

pub mod capability;
pub mod classifier;
pub mod compiler;
pub mod duckdb_engine;
pub mod geojson;
pub mod manager;
pub mod normalizer;
pub mod postgis_engine;
pub mod rebuilder;
pub mod retrieval;
pub mod types;

pub use manager::{FederatedQuery, FederatedResult};

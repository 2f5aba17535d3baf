//! Canonical entity model: typed payloads, per-type schemas, normalization and
//! content hashing.

pub mod hash;
pub mod models;
pub mod normalizer;
pub mod schema;

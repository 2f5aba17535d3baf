//! Transformer DAG: per-connection stage graphs run over every normalized entity.
//!
//! Graphs are fan-out-only forests. Each source record produces an independent
//! lineage, so one failing record never affects its siblings.

pub mod engine;
pub mod models;
pub mod stages;
pub mod traits;

//! Sync cursor: per-connection content hashes used to decide insert, update,
//! skip and delete across runs.

pub mod delta;
pub mod models;
pub mod traits;

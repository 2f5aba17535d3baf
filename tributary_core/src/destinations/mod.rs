//! Destination stores (vector + graph), embedding, and the batch writer that
//! commits decided actions and advances the cursor.

pub mod embedder;
pub mod memory;
pub mod traits;
pub mod writer;

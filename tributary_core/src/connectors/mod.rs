//! Source connector contract, factory registry and the extraction driver.

pub mod extract;
pub mod models;
pub mod registry;
pub mod traits;

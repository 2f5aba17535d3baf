//! Optional connectors implementing `tributary_core::SourceConnector`.

#[cfg(feature = "filesystem")]
pub mod filesystem;
#[cfg(feature = "http_json")]
pub mod http_json;

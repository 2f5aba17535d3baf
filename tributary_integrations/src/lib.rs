//! Pluggable leaves for Tributary: source connectors and destination stores.
//!
//! Each leaf is feature-gated so deployments only pull in the clients they use.

use tributary_core::{ConnectorRegistry, Result};

pub mod connectors;
#[cfg(feature = "postgres")]
pub mod graph;
#[cfg(feature = "postgres")]
mod pg;
#[cfg(feature = "postgres")]
pub mod vector;

/// Register every connector factory compiled into this build.
#[allow(unused_variables)]
#[tracing::instrument(level = "debug", skip_all)]
pub async fn register_builtin_connectors(registry: &ConnectorRegistry) -> Result<()> {
    #[cfg(feature = "filesystem")]
    registry
        .register(std::sync::Arc::new(connectors::filesystem::LocalFilesFactory))
        .await?;
    #[cfg(feature = "http_json")]
    registry
        .register(std::sync::Arc::new(connectors::http_json::HttpJsonFactory))
        .await?;
    Ok(())
}

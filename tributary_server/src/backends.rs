//! Backend wiring for the `tributary` binary.
//!
//! Job state lives in `{data_dir}/state.db`. Destinations are Postgres
//! (pgvector + graph tables) when `TRIBUTARY_DESTINATION_DB_URL` is set, and
//! in-process otherwise. In-process destinations vanish on exit, so they are
//! paired with an in-process cursor; a persistent cursor would claim entities
//! were committed that no longer exist anywhere.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tributary_core::destinations::embedder::HashingEmbedder;
use tributary_core::destinations::memory::{MemoryGraphStore, MemoryVectorStore};
use tributary_core::storage::memory::MemoryStateDb;
use tributary_core::storage::sqlite::SqliteStateDb;
use tributary_core::transform::engine::StageRegistry;
use tributary_core::{
    Connection, ConnectorRegistry, CursorStore, Destinations, StaticCredentials, SyncConfig,
    SyncOrchestrator, SyncStore,
};
use tributary_integrations::graph::postgres::PgGraphStore;
use tributary_integrations::vector::pgvector::PgVectorStore;

use crate::manifest::Manifest;

pub const DESTINATION_DB_URL_ENV: &str = "TRIBUTARY_DESTINATION_DB_URL";
pub const EMBEDDING_DIMS_ENV: &str = "TRIBUTARY_EMBEDDING_DIMS";
const DEFAULT_EMBEDDING_DIMS: usize = 256;

#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn SyncStore>,
    pub cursor: Arc<dyn CursorStore>,
    pub destinations: Destinations,
}

fn embedding_dims() -> anyhow::Result<usize> {
    match std::env::var(EMBEDDING_DIMS_ENV) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{EMBEDDING_DIMS_ENV}={v} is not a number")),
        Err(_) => Ok(DEFAULT_EMBEDDING_DIMS),
    }
}

impl Backends {
    /// Fully in-process backends (nothing persisted).
    pub fn in_memory() -> anyhow::Result<Self> {
        let state = Arc::new(MemoryStateDb::new());
        Ok(Self {
            store: state.clone(),
            cursor: state,
            destinations: memory_destinations(embedding_dims()?)?,
        })
    }

    /// SQLite job state under `data_dir`, destinations per environment.
    #[tracing::instrument(level = "info", skip_all, fields(data_dir = %data_dir.display()))]
    pub async fn from_env(data_dir: &Path) -> anyhow::Result<Self> {
        let state = Arc::new(SqliteStateDb::new(data_dir.join("state.db")).await?);
        let dims = embedding_dims()?;

        match std::env::var(DESTINATION_DB_URL_ENV) {
            Ok(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect(&url)
                    .await
                    .context("connect destination postgres")?;
                tracing::info!(dims, "using postgres destinations");
                Ok(Self {
                    store: state.clone(),
                    cursor: state,
                    destinations: Destinations {
                        vectors: Arc::new(PgVectorStore::new(pool.clone(), dims)?),
                        graph: Arc::new(PgGraphStore::new(pool)),
                        embedder: Arc::new(HashingEmbedder::new(dims)?),
                    },
                })
            }
            Err(_) => {
                tracing::warn!(
                    "{DESTINATION_DB_URL_ENV} not set; using in-memory destinations and cursor"
                );
                Ok(Self {
                    store: state,
                    cursor: Arc::new(MemoryStateDb::new()),
                    destinations: memory_destinations(dims)?,
                })
            }
        }
    }

    pub async fn orchestrator(
        self,
        config: SyncConfig,
        credentials: Arc<StaticCredentials>,
    ) -> anyhow::Result<SyncOrchestrator> {
        let connectors = Arc::new(ConnectorRegistry::new());
        tributary_integrations::register_builtin_connectors(&connectors).await?;
        Ok(SyncOrchestrator::new(
            config,
            self.store,
            self.cursor,
            connectors,
            credentials,
            self.destinations,
            StageRegistry::new(),
        )?)
    }
}

fn memory_destinations(dims: usize) -> anyhow::Result<Destinations> {
    Ok(Destinations {
        vectors: Arc::new(MemoryVectorStore::new()),
        graph: Arc::new(MemoryGraphStore::new()),
        embedder: Arc::new(HashingEmbedder::new(dims)?),
    })
}

/// Register (or update) every manifest connection and load its credentials.
#[tracing::instrument(level = "info", skip_all, fields(connections = manifest.connections.len()))]
pub async fn register_manifest(
    orchestrator: &SyncOrchestrator,
    credentials: &StaticCredentials,
    manifest: &Manifest,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Vec<Connection>> {
    let mut out = Vec::with_capacity(manifest.connections.len());
    for entry in &manifest.connections {
        let creds = entry.credentials(&lookup)?;
        let conn = orchestrator
            .register_connection(entry.to_connection()?)
            .await
            .with_context(|| format!("register connection {} ({})", entry.id, entry.name))?;
        credentials.insert(conn.tenant_id, conn.id, creds).await;
        out.push(conn);
    }
    Ok(out)
}

/// Show only the ends of a secret.
pub fn redact(s: &str) -> String {
    if s.chars().count() <= 8 {
        return "***".to_string();
    }
    let head: String = s.chars().take(4).collect();
    let tail: String = s.chars().skip(s.chars().count() - 4).collect();
    format!("{head}***{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_keeps_only_the_ends() {
        assert_eq!(redact("short"), "***");
        assert_eq!(
            redact("postgres://user:pw@db:5432/x"),
            "post***32/x"
        );
    }
}

use crate::connectors::models::{Checkpoint, ConnectorCapabilities, Credentials, RawRecord};
use crate::entities::schema::EntitySchema;
use crate::models::{ConnectionId, TenantId};
use crate::sync::models::Connection;
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lazy, finite sequence of raw records from one `extract` invocation.
pub type RecordStream = BoxStream<'static, Result<RawRecord>>;

/// A configured connector instance bound to one connection.
///
/// Implementations live in `tributary_integrations` or customer code. They must
/// only read from the source; the pipeline never expects a connector to mutate it.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Type key this connector was built for (matches `Connection.connector_type`).
    fn connector_type(&self) -> &str;

    fn capabilities(&self) -> ConnectorCapabilities;

    /// Schemas for every entity type this connector emits.
    fn schemas(&self) -> Vec<EntitySchema>;

    /// Open a record stream. `since` is the last checkpoint persisted (or observed
    /// mid-job when resuming after a transient failure).
    async fn extract(&self, since: Option<Checkpoint>) -> Result<RecordStream>;

    /// Called once after an `AuthExpired` failure before the extraction is retried.
    async fn refresh_credentials(&self) -> Result<()> {
        Err(Error::AuthExpired(format!(
            "connector '{}' cannot refresh credentials",
            self.connector_type()
        )))
    }
}

/// Builds `SourceConnector`s for one connector type.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    fn connector_type(&self) -> &'static str;

    /// Check connection settings without contacting the source.
    fn validate_settings(&self, settings: &serde_json::Value) -> Result<()>;

    async fn build(
        &self,
        connection: &Connection,
        credentials: Credentials,
    ) -> Result<Arc<dyn SourceConnector>>;
}

/// Supplies already-issued credentials for a connection.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(
        &self,
        tenant_id: TenantId,
        connection_id: ConnectionId,
    ) -> Result<Credentials>;
}

/// In-memory credential provider. Connections without an entry get empty credentials.
#[derive(Default)]
pub struct StaticCredentials {
    entries: RwLock<HashMap<(TenantId, ConnectionId), Credentials>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(
        &self,
        tenant_id: TenantId,
        connection_id: ConnectionId,
        credentials: Credentials,
    ) {
        self.entries
            .write()
            .await
            .insert((tenant_id, connection_id), credentials);
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(
        &self,
        tenant_id: TenantId,
        connection_id: ConnectionId,
    ) -> Result<Credentials> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(tenant_id, connection_id))
            .cloned()
            .unwrap_or_default())
    }
}

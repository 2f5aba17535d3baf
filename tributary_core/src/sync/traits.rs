use crate::models::{ConnectionId, JobId, ListQuery, TenantId};
use crate::sync::models::{Connection, JobQuery, SyncCheckpoint, SyncJob};
use crate::Result;
use async_trait::async_trait;

/// Durable storage for connections, job records and extraction checkpoints.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn upsert_connection(&self, connection: &Connection) -> Result<()>;

    async fn get_connection(&self, id: ConnectionId) -> Result<Option<Connection>>;

    /// All connections (or one tenant's), ordered by creation time.
    async fn list_connections(
        &self,
        tenant_id: Option<TenantId>,
        query: ListQuery,
    ) -> Result<Vec<Connection>>;

    async fn delete_connection(&self, id: ConnectionId) -> Result<()>;

    async fn insert_job(&self, job: &SyncJob) -> Result<()>;

    /// Persist a job's new state. Fails with `Conflict` if the stored job is already terminal.
    async fn update_job(&self, job: &SyncJob) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Option<SyncJob>>;

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<SyncJob>>;

    async fn get_checkpoint(&self, connection_id: ConnectionId) -> Result<Option<SyncCheckpoint>>;

    async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()>;

    async fn clear_checkpoint(&self, connection_id: ConnectionId) -> Result<()>;
}

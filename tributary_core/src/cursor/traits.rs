use crate::cursor::models::{CursorEntry, CursorMutation};
use crate::models::ConnectionId;
use crate::Result;
use async_trait::async_trait;

/// Durable per-connection content-hash cursor.
///
/// Only the Running job of a connection writes to its cursor; the orchestrator's
/// admission control guarantees a single writer.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, connection_id: ConnectionId) -> Result<Vec<CursorEntry>>;

    /// Apply all mutations atomically: either every one is visible afterwards or none is.
    async fn apply(&self, connection_id: ConnectionId, mutations: &[CursorMutation]) -> Result<()>;

    async fn clear(&self, connection_id: ConnectionId) -> Result<()>;
}

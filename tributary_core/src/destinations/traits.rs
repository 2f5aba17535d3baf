use crate::models::TenantId;
use crate::Result;
use async_trait::async_trait;

/// Vector index. All reads/writes are tenant scoped; `collection` is the connection id.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the vector stored under `id`.
    async fn upsert(
        &self,
        tenant_id: TenantId,
        collection: &str,
        id: &str,
        embedding: Vec<f32>,
        metadata: serde_json::Value,
    ) -> Result<()>;

    /// Remove `id`; deleting a missing id is not an error.
    async fn delete(&self, tenant_id: TenantId, collection: &str, id: &str) -> Result<()>;
}

/// Property graph. All reads/writes are tenant scoped; `graph` is the connection id.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert or replace a node's label and properties.
    async fn upsert_node(
        &self,
        tenant_id: TenantId,
        graph: &str,
        id: &str,
        label: &str,
        props: serde_json::Value,
    ) -> Result<()>;

    /// Insert or replace the `rel` edge between two nodes. Missing endpoints are
    /// created as placeholder nodes; existing nodes are left untouched.
    async fn upsert_edge(
        &self,
        tenant_id: TenantId,
        graph: &str,
        from: &str,
        to: &str,
        rel: &str,
        props: serde_json::Value,
    ) -> Result<()>;

    /// Remove a node and every edge touching it; deleting a missing node is not an error.
    async fn delete_node(&self, tenant_id: TenantId, graph: &str, id: &str) -> Result<()>;
}

/// Text embedding model.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    /// One vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

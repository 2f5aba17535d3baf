//! In-process destination stores for local runs and tests.

use crate::destinations::traits::{GraphStore, VectorStore};
use crate::models::TenantId;
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

type ScopedKey = (TenantId, String, String);

#[derive(Clone, Default)]
pub struct MemoryVectorStore {
    items: Arc<RwLock<HashMap<ScopedKey, (Vec<f32>, serde_json::Value)>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(
        &self,
        tenant_id: TenantId,
        collection: &str,
        id: &str,
    ) -> Option<(Vec<f32>, serde_json::Value)> {
        self.items
            .read()
            .await
            .get(&(tenant_id, collection.to_string(), id.to_string()))
            .cloned()
    }

    /// Ids stored in one collection, sorted.
    pub async fn ids(&self, tenant_id: TenantId, collection: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .items
            .read()
            .await
            .keys()
            .filter(|(t, c, _)| *t == tenant_id && c == collection)
            .map(|(_, _, id)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert(
        &self,
        tenant_id: TenantId,
        collection: &str,
        id: &str,
        embedding: Vec<f32>,
        metadata: serde_json::Value,
    ) -> Result<()> {
        self.items.write().await.insert(
            (tenant_id, collection.to_string(), id.to_string()),
            (embedding, metadata),
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn delete(&self, tenant_id: TenantId, collection: &str, id: &str) -> Result<()> {
        self.items
            .write()
            .await
            .remove(&(tenant_id, collection.to_string(), id.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryNode {
    pub label: String,
    pub props: serde_json::Value,
    /// Created implicitly by an edge and never upserted.
    pub placeholder: bool,
}

#[derive(Default)]
struct Graph {
    nodes: BTreeMap<String, MemoryNode>,
    /// (from, rel, to) -> props
    edges: BTreeMap<(String, String, String), serde_json::Value>,
}

#[derive(Clone, Default)]
pub struct MemoryGraphStore {
    graphs: Arc<RwLock<HashMap<(TenantId, String), Graph>>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn node(&self, tenant_id: TenantId, graph: &str, id: &str) -> Option<MemoryNode> {
        self.graphs
            .read()
            .await
            .get(&(tenant_id, graph.to_string()))
            .and_then(|g| g.nodes.get(id).cloned())
    }

    pub async fn node_ids(&self, tenant_id: TenantId, graph: &str) -> Vec<String> {
        self.graphs
            .read()
            .await
            .get(&(tenant_id, graph.to_string()))
            .map(|g| g.nodes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Edges as `(from, rel, to)`, sorted.
    pub async fn edges(&self, tenant_id: TenantId, graph: &str) -> Vec<(String, String, String)> {
        self.graphs
            .read()
            .await
            .get(&(tenant_id, graph.to_string()))
            .map(|g| g.edges.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert_node(
        &self,
        tenant_id: TenantId,
        graph: &str,
        id: &str,
        label: &str,
        props: serde_json::Value,
    ) -> Result<()> {
        let mut graphs = self.graphs.write().await;
        let g = graphs.entry((tenant_id, graph.to_string())).or_default();
        g.nodes.insert(
            id.to_string(),
            MemoryNode {
                label: label.to_string(),
                props,
                placeholder: false,
            },
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert_edge(
        &self,
        tenant_id: TenantId,
        graph: &str,
        from: &str,
        to: &str,
        rel: &str,
        props: serde_json::Value,
    ) -> Result<()> {
        let mut graphs = self.graphs.write().await;
        let g = graphs.entry((tenant_id, graph.to_string())).or_default();
        for endpoint in [from, to] {
            g.nodes
                .entry(endpoint.to_string())
                .or_insert_with(|| MemoryNode {
                    label: endpoint.split('/').next().unwrap_or_default().to_string(),
                    props: serde_json::Value::Null,
                    placeholder: true,
                });
        }
        g.edges
            .insert((from.to_string(), rel.to_string(), to.to_string()), props);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn delete_node(&self, tenant_id: TenantId, graph: &str, id: &str) -> Result<()> {
        let mut graphs = self.graphs.write().await;
        if let Some(g) = graphs.get_mut(&(tenant_id, graph.to_string())) {
            g.nodes.remove(id);
            g.edges.retain(|(from, _, to), _| from != id && to != id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn vector_store_is_tenant_scoped() {
        let store = MemoryVectorStore::new();
        let (t1, t2) = (TenantId::new(), TenantId::new());
        store.upsert(t1, "c", "x", vec![1.0], json!({})).await.unwrap();
        assert!(store.get(t1, "c", "x").await.is_some());
        assert!(store.get(t2, "c", "x").await.is_none());
        store.delete(t1, "c", "x").await.unwrap();
        store.delete(t1, "c", "missing").await.unwrap();
        assert!(store.ids(t1, "c").await.is_empty());
    }

    #[tokio::test]
    async fn edges_create_placeholders_without_clobbering_nodes() {
        let g = MemoryGraphStore::new();
        let t = TenantId::new();
        g.upsert_node(t, "c", "issue/1", "issue", json!({"title": "x"}))
            .await
            .unwrap();
        g.upsert_edge(t, "c", "project/P", "issue/1", "CONTAINS", json!({}))
            .await
            .unwrap();
        let issue = g.node(t, "c", "issue/1").await.unwrap();
        assert!(!issue.placeholder);
        assert_eq!(issue.props, json!({"title": "x"}));
        let project = g.node(t, "c", "project/P").await.unwrap();
        assert!(project.placeholder);
        assert_eq!(project.label, "project");

        g.delete_node(t, "c", "issue/1").await.unwrap();
        assert!(g.edges(t, "c").await.is_empty());
        assert_eq!(g.node_ids(t, "c").await, vec!["project/P".to_string()]);
    }
}

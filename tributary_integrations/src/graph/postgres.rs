//! PostgreSQL property-graph implementation of `GraphStore`.
//!
//! Two tables: `tributary_graph_nodes` and `tributary_graph_edges`, both scoped by
//! `(tenant_id, graph)`. Edges referencing unknown nodes create placeholder
//! nodes that a later `upsert_node` fills in.

use crate::pg::{migrate, pg_err};
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::OnceCell;
use tributary_core::{GraphStore, Result, TenantId};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tributary_graph_nodes (
    tenant_id TEXT NOT NULL,
    graph TEXT NOT NULL,
    id TEXT NOT NULL,
    label TEXT NOT NULL,
    props JSONB NOT NULL DEFAULT '{}'::jsonb,
    placeholder BOOLEAN NOT NULL DEFAULT FALSE,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (tenant_id, graph, id)
);
CREATE TABLE IF NOT EXISTS tributary_graph_edges (
    tenant_id TEXT NOT NULL,
    graph TEXT NOT NULL,
    from_id TEXT NOT NULL,
    rel TEXT NOT NULL,
    to_id TEXT NOT NULL,
    props JSONB NOT NULL DEFAULT '{}'::jsonb,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (tenant_id, graph, from_id, rel, to_id)
);
CREATE INDEX IF NOT EXISTS idx_tributary_graph_edges_to
    ON tributary_graph_edges (tenant_id, graph, to_id);
"#;

#[derive(Clone)]
pub struct PgGraphStore {
    pool: PgPool,
    initialized: OnceCell<()>,
}

/// Label given to a node that so far only exists as an edge endpoint: the entity
/// type prefix of its `type/id` key.
fn placeholder_label(id: &str) -> &str {
    id.split_once('/').map_or(id, |(ty, _)| ty)
}

impl PgGraphStore {
    #[tracing::instrument(level = "debug", skip(pool))]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            initialized: OnceCell::new(),
        }
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn ensure_schema(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| migrate(&self.pool, "graph migrate", SCHEMA))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl GraphStore for PgGraphStore {
    #[tracing::instrument(level = "debug", skip_all, fields(%tenant_id, graph, id))]
    async fn upsert_node(
        &self,
        tenant_id: TenantId,
        graph: &str,
        id: &str,
        label: &str,
        props: serde_json::Value,
    ) -> Result<()> {
        self.ensure_schema().await?;
        let sql = r#"
INSERT INTO tributary_graph_nodes (tenant_id, graph, id, label, props, placeholder)
VALUES ($1, $2, $3, $4, $5::jsonb, FALSE)
ON CONFLICT (tenant_id, graph, id) DO UPDATE
  SET label = EXCLUDED.label,
      props = EXCLUDED.props,
      placeholder = FALSE,
      updated_at = NOW()
"#;
        sqlx::query(sql)
            .bind(tenant_id.to_string())
            .bind(graph)
            .bind(id)
            .bind(label)
            .bind(props)
            .execute(&self.pool)
            .await
            .map_err(|e| pg_err("graph upsert node", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%tenant_id, graph, from, rel, to))]
    async fn upsert_edge(
        &self,
        tenant_id: TenantId,
        graph: &str,
        from: &str,
        to: &str,
        rel: &str,
        props: serde_json::Value,
    ) -> Result<()> {
        self.ensure_schema().await?;
        let tenant = tenant_id.to_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| pg_err("begin graph edge tx", e))?;

        for endpoint in [from, to] {
            sqlx::query(
                r#"
INSERT INTO tributary_graph_nodes (tenant_id, graph, id, label, placeholder)
VALUES ($1, $2, $3, $4, TRUE)
ON CONFLICT (tenant_id, graph, id) DO NOTHING
"#,
            )
            .bind(&tenant)
            .bind(graph)
            .bind(endpoint)
            .bind(placeholder_label(endpoint))
            .execute(&mut *tx)
            .await
            .map_err(|e| pg_err("graph placeholder node", e))?;
        }

        sqlx::query(
            r#"
INSERT INTO tributary_graph_edges (tenant_id, graph, from_id, rel, to_id, props)
VALUES ($1, $2, $3, $4, $5, $6::jsonb)
ON CONFLICT (tenant_id, graph, from_id, rel, to_id) DO UPDATE
  SET props = EXCLUDED.props,
      updated_at = NOW()
"#,
        )
        .bind(&tenant)
        .bind(graph)
        .bind(from)
        .bind(rel)
        .bind(to)
        .bind(props)
        .execute(&mut *tx)
        .await
        .map_err(|e| pg_err("graph upsert edge", e))?;

        tx.commit()
            .await
            .map_err(|e| pg_err("commit graph edge tx", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%tenant_id, graph, id))]
    async fn delete_node(&self, tenant_id: TenantId, graph: &str, id: &str) -> Result<()> {
        self.ensure_schema().await?;
        let tenant = tenant_id.to_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| pg_err("begin graph delete tx", e))?;
        sqlx::query(
            r#"
DELETE FROM tributary_graph_edges
 WHERE tenant_id = $1 AND graph = $2 AND (from_id = $3 OR to_id = $3)
"#,
        )
        .bind(&tenant)
        .bind(graph)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| pg_err("graph delete edges", e))?;
        sqlx::query("DELETE FROM tributary_graph_nodes WHERE tenant_id = $1 AND graph = $2 AND id = $3")
            .bind(&tenant)
            .bind(graph)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| pg_err("graph delete node", e))?;
        tx.commit()
            .await
            .map_err(|e| pg_err("commit graph delete tx", e))?;
        Ok(())
    }
}

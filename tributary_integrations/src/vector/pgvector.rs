//! PostgreSQL + pgvector implementation of `VectorStore`.
//!
//! Rows are keyed `(tenant_id, collection, id)`; the collection is the
//! connection id, so revoking a connection leaves other tenants untouched.

use crate::pg::{migrate, pg_err};
use async_trait::async_trait;
use sqlx::PgPool;
use std::fmt::Write as _;
use tokio::sync::OnceCell;
use tributary_core::{Error, Result, TenantId, VectorStore};

#[derive(Clone)]
pub struct PgVectorStore {
    pool: PgPool,
    dimension: usize,
    initialized: OnceCell<()>,
}

impl PgVectorStore {
    #[tracing::instrument(level = "debug", skip(pool))]
    pub fn new(pool: PgPool, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidInput(
                "pgvector dimension must be > 0".to_string(),
            ));
        }
        Ok(Self {
            pool,
            dimension,
            initialized: OnceCell::new(),
        })
    }

    fn embedding_literal(dimension: usize, embedding: &[f32]) -> Result<String> {
        if embedding.len() != dimension {
            return Err(Error::FatalDestination(format!(
                "embedding dimension mismatch: expected {dimension}, got {}",
                embedding.len()
            )));
        }
        // pgvector text input: "[1,2,3]".
        let mut s = String::with_capacity(embedding.len() * 12 + 2);
        s.push('[');
        for (i, v) in embedding.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            write!(&mut s, "{v:.8}").map_err(|e| Error::backend("format embedding literal", e))?;
        }
        s.push(']');
        Ok(s)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn ensure_schema(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                let dim = self.dimension;
                let ddl = format!(
                    r#"
CREATE EXTENSION IF NOT EXISTS vector;
CREATE TABLE IF NOT EXISTS tributary_vectors (
    tenant_id TEXT NOT NULL,
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    embedding vector({dim}) NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (tenant_id, collection, id)
);
CREATE INDEX IF NOT EXISTS idx_tributary_vectors_embedding
    ON tributary_vectors USING ivfflat (embedding vector_cosine_ops);
"#
                );
                migrate(&self.pool, "pgvector migrate", &ddl).await
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    #[tracing::instrument(level = "debug", skip_all, fields(%tenant_id, collection, id))]
    async fn upsert(
        &self,
        tenant_id: TenantId,
        collection: &str,
        id: &str,
        embedding: Vec<f32>,
        metadata: serde_json::Value,
    ) -> Result<()> {
        self.ensure_schema().await?;
        let embedding = Self::embedding_literal(self.dimension, &embedding)?;

        let sql = r#"
INSERT INTO tributary_vectors
  (tenant_id, collection, id, embedding, metadata)
VALUES
  ($1, $2, $3, $4::vector, $5::jsonb)
ON CONFLICT (tenant_id, collection, id) DO UPDATE
  SET embedding = EXCLUDED.embedding,
      metadata = EXCLUDED.metadata,
      updated_at = NOW()
"#;
        sqlx::query(sql)
            .bind(tenant_id.to_string())
            .bind(collection)
            .bind(id)
            .bind(embedding)
            .bind(metadata)
            .execute(&self.pool)
            .await
            .map_err(|e| pg_err("pgvector upsert", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%tenant_id, collection, id))]
    async fn delete(&self, tenant_id: TenantId, collection: &str, id: &str) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(
            "DELETE FROM tributary_vectors WHERE tenant_id = $1 AND collection = $2 AND id = $3",
        )
        .bind(tenant_id.to_string())
        .bind(collection)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| pg_err("pgvector delete", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_uses_fixed_precision() {
        let s = PgVectorStore::embedding_literal(3, &[1.0, -0.5, 0.125]).unwrap();
        assert_eq!(s, "[1.00000000,-0.50000000,0.12500000]");
    }

    #[test]
    fn dimension_mismatch_is_fatal() {
        let err = PgVectorStore::embedding_literal(4, &[1.0]).unwrap_err();
        assert!(matches!(err, Error::FatalDestination(_)));
    }
}

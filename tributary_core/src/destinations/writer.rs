use crate::cursor::models::{CursorEntry, CursorMutation, SyncAction};
use crate::cursor::traits::CursorStore;
use crate::destinations::traits::{Embedder, GraphStore, VectorStore};
use crate::entities::models::{Entity, EntityKey};
use crate::models::{ConnectionId, JobId, TenantId};
use crate::retry::{with_timeout, RetryPolicy};
use crate::{Error, Result};
use chrono::Utc;
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Edge type linking a breadcrumb parent to its child.
pub const CONTAINS: &str = "CONTAINS";

/// External stores every connection writes into.
#[derive(Clone)]
pub struct Destinations {
    pub vectors: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub embedder: Arc<dyn Embedder>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitCounts {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
}

impl CommitCounts {
    /// Entities the batch would have written to destinations.
    pub fn writes(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// Commits decided batches for one connection.
///
/// Destinations are written first and the cursor advanced second, so a crash in
/// between re-processes the batch on the next run instead of losing it. All
/// destination writes are idempotent upserts/deletes, which makes whole-batch
/// retry safe.
pub struct DestinationWriter {
    tenant_id: TenantId,
    connection_id: ConnectionId,
    collection: String,
    destinations: Destinations,
    cursor: Arc<dyn CursorStore>,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl DestinationWriter {
    pub fn new(
        tenant_id: TenantId,
        connection_id: ConnectionId,
        destinations: Destinations,
        cursor: Arc<dyn CursorStore>,
        call_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tenant_id,
            connection_id,
            collection: connection_id.to_string(),
            destinations,
            cursor,
            call_timeout,
            retry,
        }
    }

    /// Write one batch and advance the cursor for exactly the entities in it.
    ///
    /// Fails with `FatalDestination` when the destination rejects the batch or the
    /// retry budget runs out; the cursor is left untouched in that case.
    #[tracing::instrument(
        level = "debug",
        skip(self, batch),
        fields(tenant_id = %self.tenant_id, connection_id = %self.connection_id, size = batch.len())
    )]
    pub async fn commit(&self, job_id: JobId, batch: Vec<SyncAction>) -> Result<CommitCounts> {
        let mut counts = CommitCounts::default();
        let mut upserts: Vec<&Entity> = Vec::new();
        let mut deletes: Vec<&EntityKey> = Vec::new();
        let mut skips: Vec<&EntityKey> = Vec::new();
        for action in &batch {
            match action {
                SyncAction::Insert(e) => {
                    counts.inserted += 1;
                    upserts.push(e);
                }
                SyncAction::Update(e) => {
                    counts.updated += 1;
                    upserts.push(e);
                }
                SyncAction::Delete(k) => {
                    counts.deleted += 1;
                    deletes.push(k);
                }
                SyncAction::Skip(k) => {
                    counts.skipped += 1;
                    skips.push(k);
                }
            }
        }

        if !upserts.is_empty() || !deletes.is_empty() {
            self.retry
                .run("destination.write", |_| self.write_destinations(&upserts, &deletes))
                .await
                .map_err(|e| match e {
                    Error::FatalDestination(m) => Error::FatalDestination(m),
                    other => Error::FatalDestination(format!(
                        "batch of {} writes failed: {other}",
                        upserts.len() + deletes.len()
                    )),
                })?;
        }

        let now = Utc::now();
        let mut mutations = Vec::with_capacity(batch.len());
        for e in &upserts {
            mutations.push(CursorMutation::Upsert(CursorEntry {
                key: e.key(),
                content_hash: e.content_hash.clone(),
                lineage_root: e.lineage_root.clone(),
                last_seen_job_id: job_id,
                updated_at: now,
            }));
        }
        for k in &deletes {
            mutations.push(CursorMutation::Remove((*k).clone()));
        }
        for k in &skips {
            mutations.push(CursorMutation::Touch {
                key: (*k).clone(),
                job_id,
                at: now,
            });
        }
        if !mutations.is_empty() {
            self.retry
                .run("cursor.apply", |_| {
                    with_timeout(
                        "cursor.apply",
                        self.call_timeout,
                        self.cursor.apply(self.connection_id, &mutations),
                    )
                })
                .await
                .map_err(|e| Error::FatalDestination(format!("cursor commit failed: {e}")))?;
        }

        tracing::debug!(
            inserted = counts.inserted,
            updated = counts.updated,
            deleted = counts.deleted,
            skipped = counts.skipped,
            "batch committed"
        );
        Ok(counts)
    }

    async fn write_destinations(&self, upserts: &[&Entity], deletes: &[&EntityKey]) -> Result<()> {
        let d = &self.destinations;
        let t = self.call_timeout;

        if !upserts.is_empty() {
            let texts: Vec<String> = upserts.iter().map(|e| e.embedding_text()).collect();
            let vectors = with_timeout("embedder.embed", t, d.embedder.embed(&texts)).await?;
            if vectors.len() != upserts.len() {
                return Err(Error::FatalDestination(format!(
                    "embedder returned {} vectors for {} inputs",
                    vectors.len(),
                    upserts.len()
                )));
            }

            try_join_all(upserts.iter().zip(vectors).map(|(e, vector)| async move {
                let id = e.key().to_string();
                let mut metadata = e.metadata();
                metadata["tenant_id"] = serde_json::json!(self.tenant_id);
                metadata["connection_id"] = serde_json::json!(self.connection_id);
                with_timeout(
                    "vector.upsert",
                    t,
                    d.vectors
                        .upsert(self.tenant_id, &self.collection, &id, vector, metadata.clone()),
                )
                .await?;
                with_timeout(
                    "graph.upsert_node",
                    t,
                    d.graph
                        .upsert_node(self.tenant_id, &self.collection, &id, &e.entity_type, metadata),
                )
                .await
            }))
            .await?;

            let edges: BTreeSet<(String, String)> =
                upserts.iter().flat_map(|e| hierarchy_edges(e)).collect();
            try_join_all(edges.iter().map(|(from, to)| {
                with_timeout(
                    "graph.upsert_edge",
                    t,
                    d.graph.upsert_edge(
                        self.tenant_id,
                        &self.collection,
                        from,
                        to,
                        CONTAINS,
                        serde_json::json!({}),
                    ),
                )
            }))
            .await?;
        }

        try_join_all(deletes.iter().map(|k| async move {
            let id = k.to_string();
            with_timeout(
                "vector.delete",
                t,
                d.vectors.delete(self.tenant_id, &self.collection, &id),
            )
            .await?;
            with_timeout(
                "graph.delete_node",
                t,
                d.graph.delete_node(self.tenant_id, &self.collection, &id),
            )
            .await
        }))
        .await?;
        Ok(())
    }
}

/// Parent-to-child edges along an entity's breadcrumb chain, ending at the entity.
pub fn hierarchy_edges(e: &Entity) -> Vec<(String, String)> {
    let mut chain: Vec<String> = e.breadcrumbs.iter().map(|b| b.key().to_string()).collect();
    chain.push(e.key().to_string());
    chain
        .windows(2)
        .map(|w| (w[0].clone(), w[1].clone()))
        .collect()
}

use crate::cursor::models::{CursorEntry, CursorMutation};
use crate::cursor::traits::CursorStore;
use crate::entities::models::EntityKey;
use crate::models::{ConnectionId, JobId, ListQuery, TenantId};
use crate::sync::models::{Connection, JobQuery, SyncCheckpoint, SyncJob};
use crate::sync::traits::SyncStore;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    connections: BTreeMap<ConnectionId, Connection>,
    jobs: HashMap<JobId, SyncJob>,
    checkpoints: HashMap<ConnectionId, SyncCheckpoint>,
    cursors: HashMap<ConnectionId, BTreeMap<EntityKey, CursorEntry>>,
}

/// Process-local `SyncStore` + `CursorStore` for tests and dev runs.
#[derive(Default)]
pub struct MemoryStateDb {
    state: RwLock<State>,
}

impl MemoryStateDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStore for MemoryStateDb {
    async fn upsert_connection(&self, connection: &Connection) -> Result<()> {
        self.state
            .write()
            .await
            .connections
            .insert(connection.id, connection.clone());
        Ok(())
    }

    async fn get_connection(&self, id: ConnectionId) -> Result<Option<Connection>> {
        Ok(self.state.read().await.connections.get(&id).cloned())
    }

    async fn list_connections(
        &self,
        tenant_id: Option<TenantId>,
        query: ListQuery,
    ) -> Result<Vec<Connection>> {
        let state = self.state.read().await;
        let mut all: Vec<&Connection> = state
            .connections
            .values()
            .filter(|c| tenant_id.map_or(true, |t| t == c.tenant_id))
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn delete_connection(&self, id: ConnectionId) -> Result<()> {
        let mut state = self.state.write().await;
        state.connections.remove(&id);
        state.checkpoints.remove(&id);
        state.cursors.remove(&id);
        Ok(())
    }

    async fn insert_job(&self, job: &SyncJob) -> Result<()> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.job_id) {
            return Err(Error::Conflict(format!("job {} already exists", job.job_id)));
        }
        state.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &SyncJob) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(existing) = state.jobs.get_mut(&job.job_id) else {
            return Err(Error::NotFound(format!("job {}", job.job_id)));
        };
        if existing.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "job {} is already {}",
                job.job_id, existing.status
            )));
        }
        *existing = job.clone();
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<SyncJob>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<SyncJob>> {
        let state = self.state.read().await;
        let mut jobs: Vec<&SyncJob> = state.jobs.values().filter(|j| query.matches(j)).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.job_id.cmp(&a.job_id)));
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        Ok(jobs
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_checkpoint(&self, connection_id: ConnectionId) -> Result<Option<SyncCheckpoint>> {
        Ok(self.state.read().await.checkpoints.get(&connection_id).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        self.state
            .write()
            .await
            .checkpoints
            .insert(checkpoint.connection_id, checkpoint.clone());
        Ok(())
    }

    async fn clear_checkpoint(&self, connection_id: ConnectionId) -> Result<()> {
        self.state.write().await.checkpoints.remove(&connection_id);
        Ok(())
    }
}

#[async_trait]
impl CursorStore for MemoryStateDb {
    async fn load(&self, connection_id: ConnectionId) -> Result<Vec<CursorEntry>> {
        Ok(self
            .state
            .read()
            .await
            .cursors
            .get(&connection_id)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn apply(&self, connection_id: ConnectionId, mutations: &[CursorMutation]) -> Result<()> {
        // A single write lock makes the whole batch visible at once.
        let mut state = self.state.write().await;
        let cursor = state.cursors.entry(connection_id).or_default();
        for m in mutations {
            match m {
                CursorMutation::Upsert(entry) => {
                    cursor.insert(entry.key.clone(), entry.clone());
                }
                CursorMutation::Touch { key, job_id, at } => {
                    if let Some(entry) = cursor.get_mut(key) {
                        entry.last_seen_job_id = *job_id;
                        entry.updated_at = *at;
                    }
                }
                CursorMutation::Remove(key) => {
                    cursor.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn clear(&self, connection_id: ConnectionId) -> Result<()> {
        self.state.write().await.cursors.remove(&connection_id);
        Ok(())
    }
}

use crate::entities::models::{Entity, EntityKey};
use crate::models::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last committed state of one entity for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorEntry {
    pub key: EntityKey,
    pub content_hash: String,
    /// Source record the entity was derived from.
    pub lineage_root: EntityKey,
    pub last_seen_job_id: JobId,
    pub updated_at: DateTime<Utc>,
}

/// What the writer must do for one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    Insert(Entity),
    Update(Entity),
    /// Unchanged since the last commit; no destination write.
    Skip(EntityKey),
    Delete(EntityKey),
}

impl SyncAction {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::Insert(e) | Self::Update(e) => e.key(),
            Self::Skip(k) | Self::Delete(k) => k.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Skip(_) => "skip",
            Self::Delete(_) => "delete",
        }
    }
}

/// Cursor change applied after the matching destination writes succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorMutation {
    Upsert(CursorEntry),
    /// Refresh `last_seen_job_id` of an unchanged entry.
    Touch {
        key: EntityKey,
        job_id: JobId,
        at: DateTime<Utc>,
    },
    Remove(EntityKey),
}

//! SQLite-backed sync state.
//!
//! Persists connections, job records, extraction checkpoints and the per-entity
//! content-hash cursor across restarts. Single WAL-mode SQLite file.
//!
//! Usage:
//! ```ignore
//! let db = SqliteStateDb::new("/var/lib/tributary/state.db").await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::connectors::models::Checkpoint;
use crate::cursor::models::{CursorEntry, CursorMutation};
use crate::cursor::traits::CursorStore;
use crate::entities::models::EntityKey;
use crate::error::{Error as CoreError, Result as CoreResult};
use crate::models::{ConnectionId, JobId, ListQuery, TenantId};
use crate::sync::models::{Connection, JobQuery, SyncCheckpoint, SyncJob};
use crate::sync::traits::SyncStore;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// A durable, file-backed state store backed by a single SQLite file (WAL mode).
///
/// Implements both `SyncStore` and `CursorStore`, so cursor commits and job
/// records share one file and survive process restarts.
#[derive(Clone)]
pub struct SqliteStateDb {
    pool: SqlitePool,
}

impl SqliteStateDb {
    /// Create (or open) the state database at the given file path.
    ///
    /// Creates the file and parent directories if they don't exist.
    /// Runs the internal schema migration on startup.
    pub async fn new(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::backend("sqlite_state_db", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| CoreError::backend("sqlite_state_db", e))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| CoreError::backend("sqlite_state_db", e))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| CoreError::backend("sqlite_state_db_migration", e))?;

        Ok(Self { pool })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS connections (
    connection_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    connector_type TEXT NOT NULL,
    settings_json TEXT NOT NULL,
    dag_json TEXT NOT NULL,
    schedule_json TEXT,
    enabled INTEGER NOT NULL,
    force_full_sync INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_connections_tenant ON connections(tenant_id, created_at);

CREATE TABLE IF NOT EXISTS sync_jobs (
    job_id TEXT PRIMARY KEY,
    connection_id TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    trigger_kind TEXT NOT NULL,
    status TEXT NOT NULL,
    sync_mode TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    stats_json TEXT NOT NULL,
    error_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_sync_jobs_connection ON sync_jobs(connection_id, created_at);
CREATE INDEX IF NOT EXISTS idx_sync_jobs_status ON sync_jobs(status);

CREATE TABLE IF NOT EXISTS sync_checkpoints (
    connection_id TEXT PRIMARY KEY,
    checkpoint_json TEXT NOT NULL,
    job_id TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_cursor (
    connection_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    lineage_type TEXT NOT NULL,
    lineage_id TEXT NOT NULL,
    last_seen_job_id TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (connection_id, entity_type, entity_id)
);
"#;

// ── Helpers ─────────────────────────────────────────────────────

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::backend("sqlite_state_db", e)
}

fn json_err(e: serde_json::Error) -> CoreError {
    CoreError::backend("sqlite_state_db_json", e)
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_dt(s: &str) -> CoreResult<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .map_err(|_| CoreError::BackendMessage(format!("invalid timestamp in state db: {s}")))
}

fn parse_id<T: FromStr>(s: &str) -> CoreResult<T> {
    s.parse::<T>()
        .map_err(|_| CoreError::BackendMessage(format!("invalid id in state db: {s}")))
}

fn row_to_connection(r: &sqlx::sqlite::SqliteRow) -> CoreResult<Connection> {
    let connection_id: String = r.get("connection_id");
    let tenant_id: String = r.get("tenant_id");
    let settings_json: String = r.get("settings_json");
    let dag_json: String = r.get("dag_json");
    let schedule_json: Option<String> = r.get("schedule_json");
    let enabled: i64 = r.get("enabled");
    let force_full_sync: i64 = r.get("force_full_sync");
    let created_at: String = r.get("created_at");
    let updated_at: String = r.get("updated_at");

    Ok(Connection {
        id: parse_id(&connection_id)?,
        tenant_id: parse_id(&tenant_id)?,
        name: r.get("name"),
        connector_type: r.get("connector_type"),
        settings: serde_json::from_str(&settings_json).map_err(json_err)?,
        dag: serde_json::from_str(&dag_json).map_err(json_err)?,
        schedule: schedule_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(json_err)?,
        enabled: enabled != 0,
        force_full_sync: force_full_sync != 0,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

fn row_to_job(r: &sqlx::sqlite::SqliteRow) -> CoreResult<SyncJob> {
    let job_id: String = r.get("job_id");
    let connection_id: String = r.get("connection_id");
    let tenant_id: String = r.get("tenant_id");
    let trigger_kind: String = r.get("trigger_kind");
    let status: String = r.get("status");
    let sync_mode: Option<String> = r.get("sync_mode");
    let created_at: String = r.get("created_at");
    let started_at: Option<String> = r.get("started_at");
    let finished_at: Option<String> = r.get("finished_at");
    let stats_json: String = r.get("stats_json");
    let error_json: Option<String> = r.get("error_json");

    Ok(SyncJob {
        job_id: parse_id(&job_id)?,
        connection_id: parse_id(&connection_id)?,
        tenant_id: parse_id(&tenant_id)?,
        trigger_kind: trigger_kind.parse()?,
        status: status.parse()?,
        sync_mode: sync_mode.map(|m| m.parse()).transpose()?,
        created_at: parse_dt(&created_at)?,
        started_at: started_at.as_deref().map(parse_dt).transpose()?,
        finished_at: finished_at.as_deref().map(parse_dt).transpose()?,
        stats: serde_json::from_str(&stats_json).map_err(json_err)?,
        error: error_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(json_err)?,
    })
}

fn row_to_cursor_entry(r: &sqlx::sqlite::SqliteRow) -> CoreResult<CursorEntry> {
    let last_seen: String = r.get("last_seen_job_id");
    let updated_at: String = r.get("updated_at");
    Ok(CursorEntry {
        key: EntityKey::new(
            r.get::<String, _>("entity_type"),
            r.get::<String, _>("entity_id"),
        ),
        content_hash: r.get("content_hash"),
        lineage_root: EntityKey::new(
            r.get::<String, _>("lineage_type"),
            r.get::<String, _>("lineage_id"),
        ),
        last_seen_job_id: parse_id::<JobId>(&last_seen)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

// ── SyncStore impl ──────────────────────────────────────────────

#[async_trait]
impl SyncStore for SqliteStateDb {
    async fn upsert_connection(&self, c: &Connection) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO connections (connection_id, tenant_id, name, connector_type, settings_json,
                dag_json, schedule_json, enabled, force_full_sync, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(connection_id) DO UPDATE SET
                name = excluded.name,
                connector_type = excluded.connector_type,
                settings_json = excluded.settings_json,
                dag_json = excluded.dag_json,
                schedule_json = excluded.schedule_json,
                enabled = excluded.enabled,
                force_full_sync = excluded.force_full_sync,
                updated_at = excluded.updated_at",
        )
        .bind(c.id.to_string())
        .bind(c.tenant_id.to_string())
        .bind(&c.name)
        .bind(&c.connector_type)
        .bind(serde_json::to_string(&c.settings).map_err(json_err)?)
        .bind(serde_json::to_string(&c.dag).map_err(json_err)?)
        .bind(
            c.schedule
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(json_err)?,
        )
        .bind(c.enabled as i64)
        .bind(c.force_full_sync as i64)
        .bind(ts(c.created_at))
        .bind(ts(c.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_connection(&self, id: ConnectionId) -> CoreResult<Option<Connection>> {
        let row = sqlx::query("SELECT * FROM connections WHERE connection_id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| row_to_connection(&r)).transpose()
    }

    async fn list_connections(
        &self,
        tenant_id: Option<TenantId>,
        query: ListQuery,
    ) -> CoreResult<Vec<Connection>> {
        let rows = sqlx::query(
            "SELECT * FROM connections
             WHERE (?1 IS NULL OR tenant_id = ?1)
             ORDER BY created_at ASC, connection_id ASC
             LIMIT ?2 OFFSET ?3",
        )
        .bind(tenant_id.map(|t| t.to_string()))
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_connection).collect()
    }

    async fn delete_connection(&self, id: ConnectionId) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for sql in [
            "DELETE FROM sync_cursor WHERE connection_id = ?1",
            "DELETE FROM sync_checkpoints WHERE connection_id = ?1",
            "DELETE FROM connections WHERE connection_id = ?1",
        ] {
            sqlx::query(sql)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn insert_job(&self, job: &SyncJob) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO sync_jobs (job_id, connection_id, tenant_id, trigger_kind, status, sync_mode,
                created_at, started_at, finished_at, stats_json, error_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(job.job_id.to_string())
        .bind(job.connection_id.to_string())
        .bind(job.tenant_id.to_string())
        .bind(job.trigger_kind.as_str())
        .bind(job.status.as_str())
        .bind(job.sync_mode.map(|m| m.as_str()))
        .bind(ts(job.created_at))
        .bind(job.started_at.map(ts))
        .bind(job.finished_at.map(ts))
        .bind(serde_json::to_string(&job.stats).map_err(json_err)?)
        .bind(
            job.error
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(json_err)?,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(d) if d.is_unique_violation() => {
                CoreError::Conflict(format!("job {} already exists", job.job_id))
            }
            _ => db_err(e),
        })?;
        Ok(())
    }

    async fn update_job(&self, job: &SyncJob) -> CoreResult<()> {
        let res = sqlx::query(
            "UPDATE sync_jobs SET status = ?2, sync_mode = ?3, started_at = ?4, finished_at = ?5,
                stats_json = ?6, error_json = ?7
             WHERE job_id = ?1 AND status IN ('pending', 'running')",
        )
        .bind(job.job_id.to_string())
        .bind(job.status.as_str())
        .bind(job.sync_mode.map(|m| m.as_str()))
        .bind(job.started_at.map(ts))
        .bind(job.finished_at.map(ts))
        .bind(serde_json::to_string(&job.stats).map_err(json_err)?)
        .bind(
            job.error
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(json_err)?,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return match self.get_job(job.job_id).await? {
                Some(existing) => Err(CoreError::Conflict(format!(
                    "job {} is already {}",
                    job.job_id, existing.status
                ))),
                None => Err(CoreError::NotFound(format!("job {}", job.job_id))),
            };
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> CoreResult<Option<SyncJob>> {
        let row = sqlx::query("SELECT * FROM sync_jobs WHERE job_id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    async fn list_jobs(&self, query: &JobQuery) -> CoreResult<Vec<SyncJob>> {
        let limit: i64 = if query.limit == 0 { -1 } else { query.limit as i64 };
        let rows = sqlx::query(
            "SELECT * FROM sync_jobs
             WHERE (?1 IS NULL OR tenant_id = ?1)
               AND (?2 IS NULL OR connection_id = ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY created_at DESC, job_id DESC
             LIMIT ?4 OFFSET ?5",
        )
        .bind(query.tenant_id.map(|t| t.to_string()))
        .bind(query.connection_id.map(|c| c.to_string()))
        .bind(query.status.map(|s| s.as_str()))
        .bind(limit)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn get_checkpoint(&self, connection_id: ConnectionId) -> CoreResult<Option<SyncCheckpoint>> {
        let row = sqlx::query(
            "SELECT connection_id, checkpoint_json, job_id, updated_at
             FROM sync_checkpoints WHERE connection_id = ?1",
        )
        .bind(connection_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(r) = row else { return Ok(None) };
        let checkpoint_json: String = r.get("checkpoint_json");
        let job_id: String = r.get("job_id");
        let updated_at: String = r.get("updated_at");
        Ok(Some(SyncCheckpoint {
            connection_id,
            checkpoint: Checkpoint::new(serde_json::from_str(&checkpoint_json).map_err(json_err)?),
            job_id: parse_id(&job_id)?,
            updated_at: parse_dt(&updated_at)?,
        }))
    }

    async fn save_checkpoint(&self, cp: &SyncCheckpoint) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO sync_checkpoints (connection_id, checkpoint_json, job_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(connection_id) DO UPDATE SET
                checkpoint_json = excluded.checkpoint_json,
                job_id = excluded.job_id,
                updated_at = excluded.updated_at",
        )
        .bind(cp.connection_id.to_string())
        .bind(serde_json::to_string(&cp.checkpoint.value).map_err(json_err)?)
        .bind(cp.job_id.to_string())
        .bind(ts(cp.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn clear_checkpoint(&self, connection_id: ConnectionId) -> CoreResult<()> {
        sqlx::query("DELETE FROM sync_checkpoints WHERE connection_id = ?1")
            .bind(connection_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ── CursorStore impl ────────────────────────────────────────────

#[async_trait]
impl CursorStore for SqliteStateDb {
    async fn load(&self, connection_id: ConnectionId) -> CoreResult<Vec<CursorEntry>> {
        let rows = sqlx::query(
            "SELECT entity_type, entity_id, content_hash, lineage_type, lineage_id,
                    last_seen_job_id, updated_at
             FROM sync_cursor WHERE connection_id = ?1
             ORDER BY entity_type, entity_id",
        )
        .bind(connection_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_cursor_entry).collect()
    }

    async fn apply(&self, connection_id: ConnectionId, mutations: &[CursorMutation]) -> CoreResult<()> {
        let conn = connection_id.to_string();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for m in mutations {
            match m {
                CursorMutation::Upsert(e) => {
                    sqlx::query(
                        "INSERT INTO sync_cursor (connection_id, entity_type, entity_id, content_hash,
                            lineage_type, lineage_id, last_seen_job_id, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                         ON CONFLICT(connection_id, entity_type, entity_id) DO UPDATE SET
                            content_hash = excluded.content_hash,
                            lineage_type = excluded.lineage_type,
                            lineage_id = excluded.lineage_id,
                            last_seen_job_id = excluded.last_seen_job_id,
                            updated_at = excluded.updated_at",
                    )
                    .bind(&conn)
                    .bind(&e.key.entity_type)
                    .bind(&e.key.entity_id)
                    .bind(&e.content_hash)
                    .bind(&e.lineage_root.entity_type)
                    .bind(&e.lineage_root.entity_id)
                    .bind(e.last_seen_job_id.to_string())
                    .bind(ts(e.updated_at))
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                }
                CursorMutation::Touch { key, job_id, at } => {
                    sqlx::query(
                        "UPDATE sync_cursor SET last_seen_job_id = ?4, updated_at = ?5
                         WHERE connection_id = ?1 AND entity_type = ?2 AND entity_id = ?3",
                    )
                    .bind(&conn)
                    .bind(&key.entity_type)
                    .bind(&key.entity_id)
                    .bind(job_id.to_string())
                    .bind(ts(*at))
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                }
                CursorMutation::Remove(key) => {
                    sqlx::query(
                        "DELETE FROM sync_cursor
                         WHERE connection_id = ?1 AND entity_type = ?2 AND entity_id = ?3",
                    )
                    .bind(&conn)
                    .bind(&key.entity_type)
                    .bind(&key.entity_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                }
            }
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn clear(&self, connection_id: ConnectionId) -> CoreResult<()> {
        sqlx::query("DELETE FROM sync_cursor WHERE connection_id = ?1")
            .bind(connection_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{JobStatus, TriggerKind};
    use serde_json::json;

    async fn db(dir: &tempfile::TempDir) -> SqliteStateDb {
        SqliteStateDb::new(dir.path().join("nested").join("state.db"))
            .await
            .unwrap()
    }

    fn entry(id: &str, hash: &str) -> CursorEntry {
        CursorEntry {
            key: EntityKey::new("doc", id),
            content_hash: hash.into(),
            lineage_root: EntityKey::new("doc", id),
            last_seen_job_id: JobId::new(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let conn = ConnectionId::new();
        {
            let db = db(&dir).await;
            db.apply(
                conn,
                &[
                    CursorMutation::Upsert(entry("a", "h1")),
                    CursorMutation::Upsert(entry("b", "h2")),
                ],
            )
            .await
            .unwrap();
            db.apply(conn, &[CursorMutation::Remove(EntityKey::new("doc", "b"))])
                .await
                .unwrap();
        }
        let db = db(&dir).await;
        let loaded = db.load(conn).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, EntityKey::new("doc", "a"));
        assert_eq!(loaded[0].content_hash, "h1");
        assert!(db.load(ConnectionId::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_updates_last_seen_job() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(&dir).await;
        let conn = ConnectionId::new();
        db.apply(conn, &[CursorMutation::Upsert(entry("a", "h1"))])
            .await
            .unwrap();
        let job = JobId::new();
        db.apply(
            conn,
            &[CursorMutation::Touch {
                key: EntityKey::new("doc", "a"),
                job_id: job,
                at: Utc::now(),
            }],
        )
        .await
        .unwrap();
        assert_eq!(db.load(conn).await.unwrap()[0].last_seen_job_id, job);
    }

    #[tokio::test]
    async fn connections_and_jobs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(&dir).await;
        let conn = Connection::new(TenantId::new(), "wiki", "local_files", json!({"root": "/tmp"}))
            .unwrap()
            .with_schedule("0 * * * *")
            .unwrap();
        db.upsert_connection(&conn).await.unwrap();
        let loaded = db.get_connection(conn.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "wiki");
        assert_eq!(loaded.schedule.as_ref().map(|s| s.expr.as_str()), Some("0 * * * *"));
        assert_eq!(
            db.list_connections(Some(conn.tenant_id), ListQuery::default())
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(db
            .list_connections(Some(TenantId::new()), ListQuery::default())
            .await
            .unwrap()
            .is_empty());

        let mut job = SyncJob::new(&conn, TriggerKind::Scheduled, Utc::now());
        db.insert_job(&job).await.unwrap();
        assert!(matches!(db.insert_job(&job).await, Err(CoreError::Conflict(_))));

        job.transition(JobStatus::Running, Utc::now()).unwrap();
        job.stats.inserted = 3;
        db.update_job(&job).await.unwrap();
        job.transition(JobStatus::Completed, Utc::now()).unwrap();
        db.update_job(&job).await.unwrap();

        let stored = db.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.stats.inserted, 3);
        assert_eq!(stored.trigger_kind, TriggerKind::Scheduled);

        // Terminal jobs are immutable.
        assert!(matches!(db.update_job(&job).await, Err(CoreError::Conflict(_))));

        let listed = db.list_jobs(&JobQuery::for_connection(conn.id)).await.unwrap();
        assert_eq!(listed.len(), 1);
        let running = JobQuery {
            status: Some(JobStatus::Running),
            ..JobQuery::default()
        };
        assert!(db.list_jobs(&running).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn checkpoints_upsert_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(&dir).await;
        let conn = ConnectionId::new();
        assert!(db.get_checkpoint(conn).await.unwrap().is_none());
        let cp = SyncCheckpoint {
            connection_id: conn,
            checkpoint: Checkpoint::new(json!({"since": "2024-01-01"})),
            job_id: JobId::new(),
            updated_at: Utc::now(),
        };
        db.save_checkpoint(&cp).await.unwrap();
        let loaded = db.get_checkpoint(conn).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint, cp.checkpoint);
        db.clear_checkpoint(conn).await.unwrap();
        assert!(db.get_checkpoint(conn).await.unwrap().is_none());
    }
}

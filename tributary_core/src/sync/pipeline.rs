//! One sync job, end to end.
//!
//! ```text
//! extract task ──[Vec<RawRecord>]──▶ process task ──[ProcessedBatch]──▶ commit loop
//!   (connector I/O)    bounded         (normalize, DAG, decide)  bounded   (writer)
//! ```
//!
//! Both channels are bounded by `SyncConfig::queue_capacity`, so a slow writer
//! stalls the connector instead of buffering the source in memory.

use crate::config::SyncConfig;
use crate::connectors::extract::{run_extraction, ExtractOutcome, ExtractSettings};
use crate::connectors::models::{Checkpoint, ConnectorCapabilities, RawRecord};
use crate::connectors::registry::ConnectorRegistry;
use crate::connectors::traits::CredentialProvider;
use crate::cursor::delta::DeltaPlanner;
use crate::cursor::models::SyncAction;
use crate::cursor::traits::CursorStore;
use crate::destinations::writer::{DestinationWriter, Destinations};
use crate::entities::normalizer::Normalizer;
use crate::entities::schema::SchemaRegistry;
use crate::sync::events::{EventBus, JobEvent};
use crate::sync::models::{Connection, SyncCheckpoint, SyncJob, SyncMode};
use crate::sync::traits::SyncStore;
use crate::transform::engine::{StageRegistry, TransformerDag};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything a job needs besides its own record.
#[derive(Clone)]
pub struct PipelineDeps {
    pub config: SyncConfig,
    pub store: Arc<dyn SyncStore>,
    pub cursor: Arc<dyn CursorStore>,
    pub connectors: Arc<ConnectorRegistry>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub destinations: Destinations,
    pub stages: Arc<StageRegistry>,
    pub events: EventBus,
}

/// Decided actions for one slice of extracted records, plus the per-entity
/// tallies the process task absorbed.
struct ProcessedBatch {
    actions: Vec<SyncAction>,
    extracted: u64,
    rejected: u64,
    failed: u64,
}

pub(crate) fn choose_mode(
    connection: &Connection,
    capabilities: ConnectorCapabilities,
    previous: Option<&SyncCheckpoint>,
) -> SyncMode {
    if capabilities.supports_incremental && previous.is_some() && !connection.force_full_sync {
        SyncMode::Incremental
    } else {
        SyncMode::Full
    }
}

/// Run `job` (already `Running`) to the point where its final status can be
/// decided. `job.stats` is kept current throughout, including on error.
#[tracing::instrument(
    level = "info",
    skip_all,
    fields(job_id = %job.job_id, connection_id = %job.connection_id, tenant_id = %job.tenant_id)
)]
pub(crate) async fn execute(
    deps: &PipelineDeps,
    job: &mut SyncJob,
    cancel: &CancellationToken,
) -> Result<()> {
    let connection = deps
        .store
        .get_connection(job.connection_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("connection {}", job.connection_id)))?;
    if connection.tenant_id != job.tenant_id {
        return Err(Error::Unauthorized(format!(
            "connection {} does not belong to tenant {}",
            connection.id, job.tenant_id
        )));
    }

    let factory = deps.connectors.get(&connection.connector_type).await?;
    let credentials = deps
        .credentials
        .credentials(connection.tenant_id, connection.id)
        .await?;
    let connector = factory.build(&connection, credentials).await?;
    let normalizer = Normalizer::new(SchemaRegistry::from_schemas(connector.schemas())?);
    let dag = TransformerDag::compile(&connection.dag, &deps.stages)?;

    let previous = deps.store.get_checkpoint(connection.id).await?;
    let capabilities = connector.capabilities();
    let mode = choose_mode(&connection, capabilities, previous.as_ref());
    job.sync_mode = Some(mode);
    let since = match mode {
        SyncMode::Incremental => previous.as_ref().map(|p| p.checkpoint.clone()),
        SyncMode::Full => None,
    };
    let planner = DeltaPlanner::new(mode, deps.cursor.load(connection.id).await?)
        .with_complete_listing(capabilities.lists_unchanged);
    tracing::info!(
        mode = mode.as_str(),
        tracked = planner.tracked(),
        dag = ?dag.order(),
        "sync job starting"
    );

    let writer = DestinationWriter::new(
        connection.tenant_id,
        connection.id,
        deps.destinations.clone(),
        deps.cursor.clone(),
        deps.config.destination_timeout(),
        deps.config.destination_retry,
    );

    // Child token: lets us stop the upstream tasks when the commit loop fails
    // without marking the job as externally cancelled.
    let stop = cancel.child_token();
    let (raw_tx, raw_rx) = mpsc::channel::<Vec<RawRecord>>(deps.config.queue_capacity);
    let (batch_tx, mut batch_rx) = mpsc::channel::<ProcessedBatch>(deps.config.queue_capacity);

    let extract_task: JoinHandle<Result<ExtractOutcome>> = tokio::spawn(run_extraction(
        connector,
        since,
        ExtractSettings {
            batch_size: deps.config.extract_batch_size,
            call_timeout: deps.config.connector_timeout(),
            retry: deps.config.connector_retry,
        },
        raw_tx,
        stop.clone(),
    ));
    let process_task: JoinHandle<DeltaPlanner> = tokio::spawn(process(
        raw_rx,
        normalizer,
        dag,
        planner,
        batch_tx,
        deps.config.commit_batch_size,
    ));

    let committed = commit_loop(deps, job, &writer, &mut batch_rx, cancel).await;
    if committed.is_err() {
        stop.cancel();
    }
    drop(batch_rx);

    let planner = join(process_task).await;
    let extracted = join(extract_task).await;
    committed?;
    let planner = planner?;
    let outcome = extracted??;

    // Source exhausted and everything committed: propagate removals.
    let deletes = planner.reconcile();
    if !deletes.is_empty() {
        tracing::info!(count = deletes.len(), "propagating deletions");
    }
    for chunk in deletes.chunks(deps.config.commit_batch_size) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("cancelled before deletion batch".to_string()));
        }
        commit_batch(deps, job, &writer, chunk.to_vec()).await?;
    }

    let checkpoint: Option<Checkpoint> = outcome
        .last_checkpoint
        .or_else(|| previous.map(|p| p.checkpoint));
    if let Some(checkpoint) = checkpoint {
        deps.store
            .save_checkpoint(&SyncCheckpoint {
                connection_id: connection.id,
                checkpoint,
                job_id: job.job_id,
                updated_at: Utc::now(),
            })
            .await?;
    }

    tracing::info!(
        extracted = job.stats.extracted,
        inserted = job.stats.inserted,
        updated = job.stats.updated,
        deleted = job.stats.deleted,
        skipped = job.stats.skipped,
        failed = job.stats.failed,
        resumes = outcome.resumes,
        "sync job finished"
    );
    Ok(())
}

async fn join<T>(handle: JoinHandle<T>) -> Result<T> {
    handle
        .await
        .map_err(|e| Error::BackendMessage(format!("pipeline task failed: {e}")))
}

/// Normalize, transform and decide each extracted record.
///
/// Schema violations and stage failures are absorbed here: the record (or
/// lineage) is counted and its previously committed entities are protected from
/// deletion. Returns the planner so the caller can reconcile.
async fn process(
    mut raw_rx: mpsc::Receiver<Vec<RawRecord>>,
    normalizer: Normalizer,
    dag: TransformerDag,
    mut planner: DeltaPlanner,
    batch_tx: mpsc::Sender<ProcessedBatch>,
    commit_batch_size: usize,
) -> DeltaPlanner {
    while let Some(records) = raw_rx.recv().await {
        let mut out = ProcessedBatch::empty();
        for raw in records {
            out.extracted += 1;
            let root = raw.key();
            if raw.unchanged {
                out.actions.extend(planner.retain_lineage(root));
            } else {
                match normalizer.normalize_record(&raw) {
                    Ok(entity) => match dag.run(&entity) {
                        Ok(outputs) => {
                            planner.observe_root(root);
                            for output in outputs {
                                out.actions.push(planner.decide(output));
                            }
                        }
                        Err(e) => {
                            tracing::warn!(entity = %root, error = %e, "lineage dropped");
                            out.failed += 1;
                            planner.protect_lineage(root);
                        }
                    },
                    Err(e) => {
                        tracing::warn!(entity = %root, error = %e, "record rejected by normalizer");
                        out.rejected += 1;
                        planner.protect_lineage(root);
                    }
                }
            }
            if out.actions.len() >= commit_batch_size {
                let full = std::mem::replace(&mut out, ProcessedBatch::empty());
                if batch_tx.send(full).await.is_err() {
                    return planner;
                }
            }
        }
        if !out.is_empty() && batch_tx.send(out).await.is_err() {
            return planner;
        }
    }
    planner
}

impl ProcessedBatch {
    fn empty() -> Self {
        Self {
            actions: Vec::new(),
            extracted: 0,
            rejected: 0,
            failed: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.extracted == 0
    }
}

async fn commit_loop(
    deps: &PipelineDeps,
    job: &mut SyncJob,
    writer: &DestinationWriter,
    batch_rx: &mut mpsc::Receiver<ProcessedBatch>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled("cancelled at commit boundary".to_string()));
            }
            next = batch_rx.recv() => match next {
                Some(b) => b,
                None => return Ok(()),
            },
        };
        job.stats.extracted += batch.extracted;
        job.stats.skipped += batch.rejected;
        job.stats.failed += batch.failed;
        if batch.actions.is_empty() {
            continue;
        }
        commit_batch(deps, job, writer, batch.actions).await?;
    }
}

/// Commit one batch and persist the job's running stats.
async fn commit_batch(
    deps: &PipelineDeps,
    job: &mut SyncJob,
    writer: &DestinationWriter,
    actions: Vec<SyncAction>,
) -> Result<()> {
    let size = actions.len() as u64;
    match writer.commit(job.job_id, actions).await {
        Ok(counts) => job.stats.add_commit(&counts),
        Err(e) => {
            job.stats.failed += size;
            return Err(e);
        }
    }
    deps.store.update_job(job).await?;
    deps.events.publish(JobEvent::Progress {
        job_id: job.job_id,
        stats: job.stats,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::models::Checkpoint;
    use crate::models::{JobId, TenantId};
    use serde_json::json;

    fn checkpoint(conn: &Connection) -> SyncCheckpoint {
        SyncCheckpoint {
            connection_id: conn.id,
            checkpoint: Checkpoint::new(json!(5)),
            job_id: JobId::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn incremental_needs_capability_checkpoint_and_no_force() {
        let mut conn = Connection::new(TenantId::new(), "c", "t", json!({})).unwrap();
        let inc = ConnectorCapabilities {
            supports_incremental: true,
            lists_unchanged: false,
        };
        let full_only = ConnectorCapabilities {
            supports_incremental: false,
            lists_unchanged: false,
        };
        let cp = checkpoint(&conn);

        assert_eq!(choose_mode(&conn, inc, Some(&cp)), SyncMode::Incremental);
        assert_eq!(choose_mode(&conn, inc, None), SyncMode::Full);
        assert_eq!(choose_mode(&conn, full_only, Some(&cp)), SyncMode::Full);
        conn.force_full_sync = true;
        assert_eq!(choose_mode(&conn, inc, Some(&cp)), SyncMode::Full);
    }
}

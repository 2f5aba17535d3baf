use crate::config::SyncConfig;
use crate::connectors::registry::ConnectorRegistry;
use crate::connectors::traits::CredentialProvider;
use crate::cursor::traits::CursorStore;
use crate::destinations::writer::Destinations;
use crate::models::{ConnectionId, JobId, TenantId};
use crate::sync::admission::{AdmissionController, AdmissionTicket};
use crate::sync::events::{EventBus, JobEvent};
use crate::sync::models::{Connection, JobError, JobQuery, JobStatus, SyncJob, TriggerKind};
use crate::sync::pipeline::{self, PipelineDeps};
use crate::sync::schedule::CronExpr;
use crate::sync::traits::SyncStore;
use crate::transform::engine::{StageRegistry, TransformerDag};
use crate::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Owns the lifecycle of every sync job in the process.
///
/// Jobs run as independent tokio tasks. Admission control keeps at most one
/// active job per connection and caps running jobs globally and per tenant;
/// only the task running a job ever writes its record.
pub struct SyncOrchestrator {
    deps: PipelineDeps,
    admission: AdmissionController,
    running: Arc<DashMap<JobId, CancellationToken>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl SyncOrchestrator {
    #[tracing::instrument(
        level = "debug",
        skip(store, cursor, connectors, credentials, destinations, stages)
    )]
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn SyncStore>,
        cursor: Arc<dyn CursorStore>,
        connectors: Arc<ConnectorRegistry>,
        credentials: Arc<dyn CredentialProvider>,
        destinations: Destinations,
        stages: StageRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let admission = AdmissionController::new(
            config.max_concurrent_jobs,
            config.max_concurrent_jobs_per_tenant,
            config.max_queued_jobs_per_tenant,
        );
        Ok(Self {
            deps: PipelineDeps {
                config,
                store,
                cursor,
                connectors,
                credentials,
                destinations,
                stages: Arc::new(stages),
                events: EventBus::default(),
            },
            admission,
            running: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.deps.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.deps.events.subscribe()
    }

    /// Validate and persist a connection (create or replace).
    ///
    /// The connector type must be registered and accept the settings, the DAG
    /// must compile and the schedule must parse. A connection id cannot move
    /// between tenants.
    #[tracing::instrument(
        level = "info",
        skip(self, connection),
        fields(connection_id = %connection.id, tenant_id = %connection.tenant_id)
    )]
    pub async fn register_connection(&self, mut connection: Connection) -> Result<Connection> {
        let factory = self.deps.connectors.get(&connection.connector_type).await?;
        factory.validate_settings(&connection.settings)?;
        TransformerDag::compile(&connection.dag, &self.deps.stages)?;
        if let Some(schedule) = &connection.schedule {
            CronExpr::parse(&schedule.expr)?;
        }

        if let Some(existing) = self.deps.store.get_connection(connection.id).await? {
            if existing.tenant_id != connection.tenant_id {
                return Err(Error::Unauthorized(format!(
                    "connection {} belongs to another tenant",
                    connection.id
                )));
            }
            connection.created_at = existing.created_at;
        }
        connection.touch(Utc::now());
        self.deps.store.upsert_connection(&connection).await?;
        tracing::info!(connector_type = %connection.connector_type, "connection registered");
        Ok(connection)
    }

    /// Remove a connection together with its cursor and checkpoint. Job history
    /// is kept. Refused while a job is active for it.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn revoke_connection(
        &self,
        tenant_id: TenantId,
        connection_id: ConnectionId,
    ) -> Result<()> {
        let connection = self
            .deps
            .store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection {connection_id}")))?;
        if connection.tenant_id != tenant_id {
            return Err(Error::Unauthorized(format!(
                "connection {connection_id} belongs to another tenant"
            )));
        }
        if let Some(job_id) = self.admission.active_job(connection_id) {
            return Err(Error::Conflict(format!(
                "connection {connection_id} has active job {job_id}"
            )));
        }
        self.deps.store.delete_connection(connection_id).await?;
        tracing::info!("connection revoked");
        Ok(())
    }

    /// Create a job for `connection_id` and hand it to admission control.
    ///
    /// Fails with `Conflict` (no job recorded) while another job for the
    /// connection is active. When the tenant's queue is full the job is
    /// recorded as failed and `ConcurrencyLimitExceeded` is returned.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn submit_job(
        &self,
        connection_id: ConnectionId,
        trigger_kind: TriggerKind,
    ) -> Result<JobId> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled("orchestrator is shutting down".to_string()));
        }
        let connection = self
            .deps
            .store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection {connection_id}")))?;
        if !connection.enabled {
            return Err(Error::InvalidInput(format!(
                "connection {connection_id} is disabled"
            )));
        }

        let mut job = SyncJob::new(&connection, trigger_kind, Utc::now());
        let ticket = match self
            .admission
            .reserve(connection.tenant_id, connection.id, job.job_id)
        {
            Ok(t) => t,
            Err(e @ Error::ConcurrencyLimitExceeded(_)) => {
                job.fail(&e, Utc::now())?;
                self.deps.store.insert_job(&job).await?;
                if let Some(ev) = JobEvent::finished(&job) {
                    self.deps.events.publish(ev);
                }
                tracing::warn!(job_id = %job.job_id, error = %e, "sync job rejected");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        // Register the token first so a cancel that sees the stored job can reach it.
        let job_id = job.job_id;
        let cancel = self.shutdown.child_token();
        self.running.insert(job_id, cancel.clone());
        if let Err(e) = self.deps.store.insert_job(&job).await {
            self.running.remove(&job_id);
            return Err(e);
        }
        self.deps.events.publish(JobEvent::Queued {
            job_id,
            connection_id,
            tenant_id: connection.tenant_id,
        });

        self.tracker.spawn(drive(
            self.deps.clone(),
            self.running.clone(),
            job,
            ticket,
            cancel,
        ));
        tracing::info!(%job_id, trigger = trigger_kind.as_str(), "sync job queued");
        Ok(job_id)
    }

    /// Request cooperative cancellation.
    ///
    /// Queued jobs end `Cancelled` without running; running jobs stop at the
    /// next batch boundary. Cancelling a finished job is a `Conflict`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        let mut job = self.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(Error::Conflict(format!("job {job_id} is already {}", job.status)));
        }
        if let Some(token) = self.running.get(&job_id) {
            token.cancel();
            return Ok(());
        }
        // Active in the store but not owned by this process.
        job.transition(JobStatus::Cancelled, Utc::now())?;
        self.deps.store.update_job(&job).await?;
        if let Some(ev) = JobEvent::finished(&job) {
            self.deps.events.publish(ev);
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_job(&self, job_id: JobId) -> Result<SyncJob> {
        self.deps
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<SyncJob>> {
        self.deps.store.list_jobs(query).await
    }

    /// Resolve once the job reaches a terminal status.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn wait_for_job(&self, job_id: JobId) -> Result<SyncJob> {
        let mut events = self.deps.events.subscribe();
        loop {
            let job = self.get_job(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            loop {
                match events.recv().await {
                    Ok(ev) if ev.job_id() == job_id && ev.is_terminal() => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::Cancelled("job event stream closed".to_string()));
                    }
                }
            }
        }
    }

    /// Mark jobs left `Pending`/`Running` by a previous process as failed.
    /// Call once at startup, before submitting new jobs.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn recover_interrupted_jobs(&self) -> Result<usize> {
        let mut recovered = 0usize;
        for status in [JobStatus::Running, JobStatus::Pending] {
            let query = JobQuery {
                status: Some(status),
                limit: 0,
                ..JobQuery::default()
            };
            for mut job in self.deps.store.list_jobs(&query).await? {
                if self.running.contains_key(&job.job_id) {
                    continue;
                }
                job.transition(JobStatus::Failed, Utc::now())?;
                job.error = Some(JobError {
                    kind: "interrupted".to_string(),
                    message: format!("process stopped while the job was {status}"),
                });
                self.deps.store.update_job(&job).await?;
                tracing::warn!(job_id = %job.job_id, connection_id = %job.connection_id, "interrupted sync job marked failed");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub fn active_jobs(&self) -> usize {
        self.running.len()
    }

    /// Cancel every job and wait for their tasks to record a final status.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("sync orchestrator stopped");
    }
}

async fn drive(
    deps: PipelineDeps,
    running: Arc<DashMap<JobId, CancellationToken>>,
    mut job: SyncJob,
    ticket: AdmissionTicket,
    cancel: CancellationToken,
) {
    let job_id = job.job_id;
    if let Err(e) = run_job(&deps, &mut job, ticket, &cancel).await {
        tracing::error!(%job_id, error = %e, "sync job could not be recorded");
        if job.status.is_active() && job.fail(&e, Utc::now()).is_ok() {
            match deps.store.update_job(&job).await {
                Ok(()) => {
                    if let Some(ev) = JobEvent::finished(&job) {
                        deps.events.publish(ev);
                    }
                }
                Err(e) => tracing::error!(%job_id, error = %e, "failed to persist job failure"),
            }
        }
    }
    running.remove(&job_id);
}

async fn run_job(
    deps: &PipelineDeps,
    job: &mut SyncJob,
    mut ticket: AdmissionTicket,
    cancel: &CancellationToken,
) -> Result<()> {
    if let Err(e) = ticket.admit(cancel).await {
        drop(ticket);
        tracing::info!(job_id = %job.job_id, reason = %e, "sync job cancelled before start");
        job.transition(JobStatus::Cancelled, Utc::now())?;
        return finish(deps, job).await;
    }

    job.transition(JobStatus::Running, Utc::now())?;
    deps.store.update_job(job).await?;
    deps.events.publish(JobEvent::Started {
        job_id: job.job_id,
        connection_id: job.connection_id,
    });

    let result = pipeline::execute(deps, job, cancel).await;
    // Free the connection before the final write so a waiter can re-trigger at once.
    drop(ticket);

    let now = Utc::now();
    match result {
        Ok(()) => job.transition(JobStatus::Completed, now)?,
        Err(Error::Cancelled(reason)) => {
            tracing::info!(job_id = %job.job_id, %reason, "sync job cancelled");
            job.transition(JobStatus::Cancelled, now)?;
        }
        Err(e) => {
            tracing::warn!(job_id = %job.job_id, error = %e, kind = e.kind(), "sync job failed");
            job.fail(&e, now)?;
        }
    }
    finish(deps, job).await
}

async fn finish(deps: &PipelineDeps, job: &SyncJob) -> Result<()> {
    deps.store.update_job(job).await?;
    if let Some(ev) = JobEvent::finished(job) {
        deps.events.publish(ev);
    }
    Ok(())
}

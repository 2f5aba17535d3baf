use crate::connectors::models::Checkpoint;
use crate::destinations::writer::CommitCounts;
use crate::models::{ConnectionId, JobId, TenantId};
use crate::sync::schedule::CronExpr;
use crate::transform::models::DagSpec;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Per-connection cron schedule (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronSchedule {
    pub expr: String,
    pub next_run_at: DateTime<Utc>,
}

impl CronSchedule {
    #[tracing::instrument(level = "debug")]
    pub fn new(expr: impl Into<String> + fmt::Debug, now: DateTime<Utc>) -> Result<Self> {
        let expr = expr.into();
        let next_run_at = CronExpr::parse(&expr)?.next_after(now)?;
        Ok(Self { expr, next_run_at })
    }
}

/// A tenant's configured binding of one source connector plus its sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub tenant_id: TenantId,
    pub name: String,
    pub connector_type: String,
    /// Connector-defined settings (validated by the connector factory).
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub dag: DagSpec,
    #[serde(default)]
    pub schedule: Option<CronSchedule>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ignore the stored checkpoint and always run a full extraction.
    #[serde(default)]
    pub force_full_sync: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Connection {
    #[tracing::instrument(level = "debug", skip(settings))]
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String> + fmt::Debug,
        connector_type: impl Into<String> + fmt::Debug,
        settings: serde_json::Value,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("connection name is empty".to_string()));
        }
        let connector_type = connector_type.into();
        if connector_type.trim().is_empty() {
            return Err(Error::InvalidInput("connector_type is empty".to_string()));
        }
        let now = Utc::now();
        Ok(Self {
            id: ConnectionId::new(),
            tenant_id,
            name,
            connector_type,
            settings,
            dag: DagSpec::default(),
            schedule: None,
            enabled: true,
            force_full_sync: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_dag(mut self, dag: DagSpec) -> Self {
        self.dag = dag;
        self
    }

    pub fn with_schedule(mut self, expr: &str) -> Result<Self> {
        self.schedule = Some(CronSchedule::new(expr, Utc::now())?);
        Ok(self)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Scheduled,
    Api,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Api => "api",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "api" => Ok(Self::Api),
            other => Err(Error::InvalidInput(format!("unknown trigger kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(Error::InvalidInput(format!("unknown sync mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the job state machine permits `self -> to`.
    ///
    /// `Pending -> Failed` covers jobs orphaned by a crash before dispatch.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown job status '{other}'"))),
        }
    }
}

/// Entity counts for one job. Always reported, even for failed jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Raw records pulled from the connector.
    pub extracted: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Unchanged entities plus records rejected by normalization.
    pub skipped: u64,
    /// Entities dropped by a stage failure or lost in a failed commit batch.
    pub failed: u64,
}

impl JobStats {
    pub fn add_commit(&mut self, c: &CommitCounts) {
        self.inserted += c.inserted;
        self.updated += c.updated;
        self.deleted += c.deleted;
        self.skipped += c.skipped;
    }
}

/// Error summary recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

impl From<&Error> for JobError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// One execution attempt for a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub job_id: JobId,
    pub connection_id: ConnectionId,
    pub tenant_id: TenantId,
    pub trigger_kind: TriggerKind,
    pub status: JobStatus,
    #[serde(default)]
    pub sync_mode: Option<SyncMode>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: JobStats,
    #[serde(default)]
    pub error: Option<JobError>,
}

impl SyncJob {
    pub fn new(connection: &Connection, trigger_kind: TriggerKind, now: DateTime<Utc>) -> Self {
        Self {
            job_id: JobId::new(),
            connection_id: connection.id,
            tenant_id: connection.tenant_id,
            trigger_kind,
            status: JobStatus::Pending,
            sync_mode: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            stats: JobStats::default(),
            error: None,
        }
    }

    /// Move to `to`, stamping timestamps. Terminal jobs are immutable.
    pub fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::Conflict(format!(
                "job {} cannot move from {} to {}",
                self.job_id, self.status, to
            )));
        }
        self.status = to;
        match to {
            JobStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    pub fn fail(&mut self, err: &Error, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Failed, now)?;
        self.error = Some(JobError::from(err));
        Ok(())
    }
}

/// Checkpoint persisted after a connection's last completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub connection_id: ConnectionId,
    pub checkpoint: Checkpoint,
    pub job_id: JobId,
    pub updated_at: DateTime<Utc>,
}

/// Job listing filter. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobQuery {
    pub tenant_id: Option<TenantId>,
    pub connection_id: Option<ConnectionId>,
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl JobQuery {
    pub fn for_connection(connection_id: ConnectionId) -> Self {
        Self {
            connection_id: Some(connection_id),
            limit: 100,
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &SyncJob) -> bool {
        self.tenant_id.map_or(true, |t| t == job.tenant_id)
            && self.connection_id.map_or(true, |c| c == job.connection_id)
            && self.status.map_or(true, |s| s == job.status)
    }
}

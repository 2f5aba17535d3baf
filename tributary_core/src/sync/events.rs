use crate::models::{ConnectionId, JobId, TenantId};
use crate::sync::models::{JobError, JobStats, SyncJob};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Job lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Queued {
        job_id: JobId,
        connection_id: ConnectionId,
        tenant_id: TenantId,
    },
    Started {
        job_id: JobId,
        connection_id: ConnectionId,
    },
    Progress {
        job_id: JobId,
        stats: JobStats,
    },
    Completed {
        job_id: JobId,
        stats: JobStats,
    },
    Failed {
        job_id: JobId,
        stats: JobStats,
        error: Option<JobError>,
    },
    Cancelled {
        job_id: JobId,
        stats: JobStats,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Queued { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }

    /// The terminal event matching a finished job's status, if it is finished.
    pub fn finished(job: &SyncJob) -> Option<Self> {
        use crate::sync::models::JobStatus;
        let job_id = job.job_id;
        let stats = job.stats;
        match job.status {
            JobStatus::Completed => Some(Self::Completed { job_id, stats }),
            JobStatus::Failed => Some(Self::Failed {
                job_id,
                stats,
                error: job.error.clone(),
            }),
            JobStatus::Cancelled => Some(Self::Cancelled { job_id, stats }),
            JobStatus::Pending | JobStatus::Running => None,
        }
    }
}

/// Fan-out of `JobEvent`s. Slow subscribers lag and miss events rather than
/// blocking jobs.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: JobEvent) {
        tracing::debug!(job_id = %event.job_id(), ?event, "job event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let job_id = JobId::new();
        bus.publish(JobEvent::Completed {
            job_id,
            stats: JobStats::default(),
        });
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.job_id(), job_id);
        assert!(ev.is_terminal());
    }

    #[test]
    fn serializes_with_event_tag() {
        let v = serde_json::to_value(JobEvent::Started {
            job_id: JobId::new(),
            connection_id: ConnectionId::new(),
        })
        .unwrap();
        assert_eq!(v["event"], "started");
    }
}

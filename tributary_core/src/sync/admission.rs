use crate::models::{ConnectionId, JobId, TenantId};
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

struct TenantSlots {
    running: Arc<Semaphore>,
    queued: AtomicUsize,
}

/// Gatekeeper for job dispatch.
///
/// - At most one active job per connection (the cursor's single writer).
/// - A bounded number of queued jobs per tenant.
/// - Global and per-tenant caps on concurrently running jobs.
#[derive(Clone)]
pub struct AdmissionController {
    global: Arc<Semaphore>,
    per_tenant: usize,
    max_queued_per_tenant: usize,
    tenants: Arc<DashMap<TenantId, Arc<TenantSlots>>>,
    active: Arc<DashMap<ConnectionId, JobId>>,
}

impl AdmissionController {
    pub fn new(global: usize, per_tenant: usize, max_queued_per_tenant: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global)),
            per_tenant,
            max_queued_per_tenant,
            tenants: Arc::new(DashMap::new()),
            active: Arc::new(DashMap::new()),
        }
    }

    /// Claim the connection's job slot and a place in the tenant's queue.
    ///
    /// `Conflict` when the connection already has an active job,
    /// `ConcurrencyLimitExceeded` when the tenant's queue is full.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn reserve(
        &self,
        tenant_id: TenantId,
        connection_id: ConnectionId,
        job_id: JobId,
    ) -> Result<AdmissionTicket> {
        let slots = self
            .tenants
            .entry(tenant_id)
            .or_insert_with(|| {
                Arc::new(TenantSlots {
                    running: Arc::new(Semaphore::new(self.per_tenant)),
                    queued: AtomicUsize::new(0),
                })
            })
            .clone();

        match self.active.entry(connection_id) {
            Entry::Occupied(o) => {
                return Err(Error::Conflict(format!(
                    "connection {connection_id} already has active job {}",
                    o.get()
                )));
            }
            Entry::Vacant(v) => {
                let queued = slots.queued.fetch_add(1, Ordering::SeqCst);
                if queued >= self.max_queued_per_tenant {
                    slots.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::ConcurrencyLimitExceeded(format!(
                        "tenant {tenant_id} already has {queued} queued jobs"
                    )));
                }
                v.insert(job_id);
            }
        }

        Ok(AdmissionTicket {
            connection_id,
            job_id,
            active: self.active.clone(),
            tenant: slots,
            global: self.global.clone(),
            queued: true,
            permits: None,
        })
    }

    pub fn active_job(&self, connection_id: ConnectionId) -> Option<JobId> {
        self.active.get(&connection_id).map(|j| *j)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// A reserved job slot. Dropping it releases the connection, any queue place
/// and any running permits.
pub struct AdmissionTicket {
    connection_id: ConnectionId,
    job_id: JobId,
    active: Arc<DashMap<ConnectionId, JobId>>,
    tenant: Arc<TenantSlots>,
    global: Arc<Semaphore>,
    queued: bool,
    permits: Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)>,
}

impl AdmissionTicket {
    /// Wait for a running slot: tenant cap first, then the global cap.
    #[tracing::instrument(level = "debug", skip_all, fields(job_id = %self.job_id))]
    pub async fn admit(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.permits.is_some() {
            return Ok(());
        }
        let tenant = acquire(self.tenant.running.clone(), cancel).await?;
        let global = acquire(self.global.clone(), cancel).await?;
        self.leave_queue();
        self.permits = Some((tenant, global));
        Ok(())
    }

    pub fn is_admitted(&self) -> bool {
        self.permits.is_some()
    }

    fn leave_queue(&mut self) {
        if self.queued {
            self.queued = false;
            self.tenant.queued.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

async fn acquire(sem: Arc<Semaphore>, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled("cancelled while queued".to_string())),
        permit = sem.acquire_owned() => {
            permit.map_err(|_| Error::Cancelled("admission closed".to_string()))
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.leave_queue();
        self.permits = None;
        let job_id = self.job_id;
        self.active.remove_if(&self.connection_id, |_, j| *j == job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn one_active_job_per_connection() {
        let ac = AdmissionController::new(4, 4, 4);
        let tenant = TenantId::new();
        let conn = ConnectionId::new();
        let first = ac.reserve(tenant, conn, JobId::new()).unwrap();
        assert!(matches!(
            ac.reserve(tenant, conn, JobId::new()),
            Err(Error::Conflict(_))
        ));
        drop(first);
        assert!(ac.reserve(tenant, conn, JobId::new()).is_ok());
    }

    #[tokio::test]
    async fn tenant_queue_is_bounded() {
        let ac = AdmissionController::new(4, 1, 2);
        let tenant = TenantId::new();
        let _a = ac.reserve(tenant, ConnectionId::new(), JobId::new()).unwrap();
        let _b = ac.reserve(tenant, ConnectionId::new(), JobId::new()).unwrap();
        assert!(matches!(
            ac.reserve(tenant, ConnectionId::new(), JobId::new()),
            Err(Error::ConcurrencyLimitExceeded(_))
        ));
        // Other tenants are unaffected.
        assert!(ac
            .reserve(TenantId::new(), ConnectionId::new(), JobId::new())
            .is_ok());
    }

    #[tokio::test]
    async fn per_tenant_cap_holds_second_job_until_first_finishes() {
        let ac = AdmissionController::new(4, 1, 4);
        let tenant = TenantId::new();
        let cancel = CancellationToken::new();
        let mut a = ac.reserve(tenant, ConnectionId::new(), JobId::new()).unwrap();
        let mut b = ac.reserve(tenant, ConnectionId::new(), JobId::new()).unwrap();
        a.admit(&cancel).await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), b.admit(&cancel)).await;
        assert!(waiting.is_err(), "second job must wait for the tenant slot");

        drop(a);
        tokio::time::timeout(Duration::from_secs(1), b.admit(&cancel))
            .await
            .unwrap()
            .unwrap();
        assert!(b.is_admitted());
    }

    #[tokio::test]
    async fn cancel_while_queued() {
        let ac = AdmissionController::new(1, 1, 4);
        let tenant = TenantId::new();
        let mut a = ac.reserve(tenant, ConnectionId::new(), JobId::new()).unwrap();
        a.admit(&CancellationToken::new()).await.unwrap();

        let conn = ConnectionId::new();
        let mut b = ac.reserve(tenant, conn, JobId::new()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(b.admit(&cancel).await, Err(Error::Cancelled(_))));
        drop(b);
        assert_eq!(ac.active_job(conn), None);
        assert_eq!(ac.active_count(), 1);
    }

    #[tokio::test]
    async fn token_cancelled_before_start_wins_over_a_free_slot() {
        let ac = AdmissionController::new(4, 4, 4);
        let mut ticket = ac
            .reserve(TenantId::new(), ConnectionId::new(), JobId::new())
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(ticket.admit(&cancel).await, Err(Error::Cancelled(_))));
        assert!(!ticket.is_admitted());
    }
}

use crate::models::ListQuery;
use crate::sync::models::{CronSchedule, TriggerKind};
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::traits::SyncStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 5-field UTC cron expression: "min hour dom month dow".
///
/// Evaluated with the `cron` crate (seconds pinned to 0). Day-of-week uses the
/// usual crontab numbering, `0-6` with 0 = Sunday (7 is Sunday too), or names
/// (`MON-FRI`).
#[derive(Debug, Clone)]
pub struct CronExpr {
    schedule: cron::Schedule,
}

impl CronExpr {
    #[tracing::instrument(level = "debug")]
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::InvalidInput(format!(
                "cron expr '{expr}' must have 5 fields: min hour dom month dow"
            )));
        }
        let invalid = |e: String| Error::InvalidInput(format!("invalid cron expression '{expr}': {e}"));
        let dow = crate_day_of_week(fields[4]).map_err(invalid)?;
        let full = format!("0 {} {} {} {} {dow}", fields[0], fields[1], fields[2], fields[3]);
        let schedule = cron::Schedule::from_str(&full).map_err(|e| invalid(e.to_string()))?;
        Ok(Self { schedule })
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.schedule.after(&after).next().ok_or_else(|| {
            Error::InvalidInput("cron expr produces no future run time".to_string())
        })
    }
}

/// Rewrite a crontab day-of-week field (0 or 7 = Sunday) into the `cron`
/// crate's numbering (1 = Sunday). Numeric items are expanded to explicit day
/// lists; names and `*` pass through unchanged.
fn crate_day_of_week(field: &str) -> std::result::Result<String, String> {
    let items = field
        .split(',')
        .map(|item| {
            if item == "*" || item == "?" {
                return Ok(item.to_string());
            }
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: usize = step
                        .parse()
                        .map_err(|_| format!("bad day-of-week step '{item}'"))?;
                    if step == 0 {
                        return Err(format!("bad day-of-week step '{item}'"));
                    }
                    (range, Some(step))
                }
                None => (item, None),
            };
            let bounds = match range.split_once('-') {
                _ if range == "*" => Some((0, 6)),
                Some((lo, hi)) => lo.parse::<u32>().ok().zip(hi.parse::<u32>().ok()),
                None => range
                    .parse::<u32>()
                    .ok()
                    .map(|d| if step.is_some() { (d, 6) } else { (d, d) }),
            };
            let Some((lo, hi)) = bounds else {
                // Day names are understood by the `cron` crate as they are.
                return Ok(item.to_string());
            };
            if hi > 7 || lo > hi {
                return Err(format!("day-of-week '{item}' is outside 0-7"));
            }
            let days: std::collections::BTreeSet<u32> = (lo..=hi)
                .step_by(step.unwrap_or(1))
                .map(|d| d % 7 + 1)
                .collect();
            Ok(days
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(","))
        })
        .collect::<std::result::Result<Vec<_>, String>>()?;
    Ok(items.join(","))
}

/// Background trigger for connections that carry a cron schedule.
pub struct SyncScheduler {
    store: Arc<dyn SyncStore>,
    orchestrator: Arc<SyncOrchestrator>,
    poll_interval: Duration,
}

impl SyncScheduler {
    #[tracing::instrument(level = "debug", skip(store, orchestrator))]
    pub fn new(
        store: Arc<dyn SyncStore>,
        orchestrator: Arc<SyncOrchestrator>,
        poll_interval: Duration,
    ) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll_interval must be > 0".to_string()));
        }
        Ok(Self {
            store,
            orchestrator,
            poll_interval,
        })
    }

    /// Tick until `cancel` fires.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("sync scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::warn!(error = %e, "sync scheduler tick failed");
                    }
                }
            }
        }
    }

    /// Submit a scheduled job for every enabled connection that is due. Returns
    /// the number of jobs submitted.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut submitted = 0usize;
        let mut offset = 0usize;
        let limit = 200usize;
        loop {
            let batch = self
                .store
                .list_connections(None, ListQuery { limit, offset })
                .await?;
            if batch.is_empty() {
                break;
            }
            let fetched = batch.len();

            for mut connection in batch {
                if !connection.enabled {
                    continue;
                }
                let Some(schedule) = connection.schedule.clone() else {
                    continue;
                };
                if now < schedule.next_run_at {
                    continue;
                }

                // Advance from `now` so a long outage fires once, not once per missed slot.
                let next = match CronSchedule::new(schedule.expr.clone(), now) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(
                            connection_id = %connection.id,
                            error = %e,
                            "connection has an unusable schedule; skipping"
                        );
                        continue;
                    }
                };
                connection.schedule = Some(next);
                connection.touch(now);
                // Persist before submitting so a crash cannot fire the same slot twice.
                self.store.upsert_connection(&connection).await?;

                match self
                    .orchestrator
                    .submit_job(connection.id, TriggerKind::Scheduled)
                    .await
                {
                    Ok(job_id) => {
                        submitted += 1;
                        tracing::info!(connection_id = %connection.id, %job_id, "scheduled sync submitted");
                    }
                    Err(Error::Conflict(m)) => {
                        tracing::debug!(connection_id = %connection.id, reason = %m, "previous sync still active; slot skipped");
                    }
                    Err(e) => {
                        tracing::warn!(connection_id = %connection.id, error = %e, "scheduled sync rejected");
                    }
                }
            }

            if fetched < limit {
                break;
            }
            offset += limit;
        }
        Ok(submitted)
    }
}

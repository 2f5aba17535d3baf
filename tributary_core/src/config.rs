use crate::retry::RetryPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime limits and budgets for the sync pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Global cap on Running jobs across all tenants.
    pub max_concurrent_jobs: usize,
    pub max_concurrent_jobs_per_tenant: usize,
    /// Pending jobs a tenant may have waiting for a slot before submissions are rejected.
    pub max_queued_jobs_per_tenant: usize,

    pub extract_batch_size: usize,
    pub commit_batch_size: usize,
    /// Depth (in batches) of the bounded queues between pipeline stages.
    pub queue_capacity: usize,

    pub connector_call_timeout_ms: u64,
    pub destination_call_timeout_ms: u64,
    pub connector_retry: RetryPolicy,
    pub destination_retry: RetryPolicy,

    pub scheduler_poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 8,
            max_concurrent_jobs_per_tenant: 2,
            max_queued_jobs_per_tenant: 16,
            extract_batch_size: 100,
            commit_batch_size: 100,
            queue_capacity: 4,
            connector_call_timeout_ms: 30_000,
            destination_call_timeout_ms: 30_000,
            connector_retry: RetryPolicy::default(),
            destination_retry: RetryPolicy {
                max_attempts: 4,
                base_delay_ms: 250,
                max_delay_ms: 10_000,
                jitter: true,
            },
            scheduler_poll_interval_ms: 60_000,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `TRIBUTARY_*` environment variables.
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        env_parse("TRIBUTARY_MAX_CONCURRENT_JOBS", &mut cfg.max_concurrent_jobs)?;
        env_parse(
            "TRIBUTARY_MAX_CONCURRENT_JOBS_PER_TENANT",
            &mut cfg.max_concurrent_jobs_per_tenant,
        )?;
        env_parse(
            "TRIBUTARY_MAX_QUEUED_JOBS_PER_TENANT",
            &mut cfg.max_queued_jobs_per_tenant,
        )?;
        env_parse("TRIBUTARY_EXTRACT_BATCH_SIZE", &mut cfg.extract_batch_size)?;
        env_parse("TRIBUTARY_COMMIT_BATCH_SIZE", &mut cfg.commit_batch_size)?;
        env_parse("TRIBUTARY_QUEUE_CAPACITY", &mut cfg.queue_capacity)?;
        env_parse(
            "TRIBUTARY_CONNECTOR_TIMEOUT_MS",
            &mut cfg.connector_call_timeout_ms,
        )?;
        env_parse(
            "TRIBUTARY_DESTINATION_TIMEOUT_MS",
            &mut cfg.destination_call_timeout_ms,
        )?;
        env_parse(
            "TRIBUTARY_CONNECTOR_MAX_ATTEMPTS",
            &mut cfg.connector_retry.max_attempts,
        )?;
        env_parse(
            "TRIBUTARY_DESTINATION_MAX_ATTEMPTS",
            &mut cfg.destination_retry.max_attempts,
        )?;
        env_parse(
            "TRIBUTARY_SCHEDULER_POLL_MS",
            &mut cfg.scheduler_poll_interval_ms,
        )?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(Error::InvalidInput(
                "max_concurrent_jobs must be > 0".to_string(),
            ));
        }
        if self.max_concurrent_jobs_per_tenant == 0 {
            return Err(Error::InvalidInput(
                "max_concurrent_jobs_per_tenant must be > 0".to_string(),
            ));
        }
        if self.extract_batch_size == 0 || self.commit_batch_size == 0 {
            return Err(Error::InvalidInput("batch sizes must be > 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidInput("queue_capacity must be > 0".to_string()));
        }
        if self.connector_call_timeout_ms == 0 || self.destination_call_timeout_ms == 0 {
            return Err(Error::InvalidInput("call timeouts must be > 0".to_string()));
        }
        if self.scheduler_poll_interval_ms == 0 {
            return Err(Error::InvalidInput(
                "scheduler_poll_interval_ms must be > 0".to_string(),
            ));
        }
        self.connector_retry.validate()?;
        self.destination_retry.validate()?;
        Ok(())
    }

    pub fn connector_timeout(&self) -> Duration {
        Duration::from_millis(self.connector_call_timeout_ms)
    }

    pub fn destination_timeout(&self) -> Duration {
        Duration::from_millis(self.destination_call_timeout_ms)
    }

    pub fn scheduler_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_poll_interval_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, slot: &mut T) -> Result<()> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            *slot = raw
                .trim()
                .parse()
                .map_err(|_| Error::InvalidInput(format!("{key} has invalid value '{raw}'")))?;
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_limits() {
        let cfg = SyncConfig {
            max_concurrent_jobs: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidInput(_))));

        let cfg = SyncConfig {
            queue_capacity: 0,
            ..SyncConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: SyncConfig =
            serde_json::from_value(serde_json::json!({"commit_batch_size": 7})).unwrap();
        assert_eq!(cfg.commit_batch_size, 7);
        assert_eq!(cfg.max_concurrent_jobs, 8);
    }
}

use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff with optional full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never sleeps; handy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidInput("max_attempts must be > 0".to_string()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::InvalidInput(
                "max_delay_ms must be >= base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (0-based), honoring a server hint when larger.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        // Exponential backoff: base * 2^retry, capped.
        let shift = retry.min(63);
        let exp = 1u128 << shift;
        let ms = (self.base_delay_ms as u128).saturating_mul(exp);
        let capped = ms.min(self.max_delay_ms as u128) as u64;
        let ms = if self.jitter && capped > 0 {
            rand::thread_rng().gen_range(capped / 2..=capped)
        } else {
            capped
        };
        let computed = Duration::from_millis(ms);
        match hint {
            Some(h) if h > computed => h.min(Duration::from_millis(self.max_delay_ms.max(ms))),
            _ => computed,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the budget runs out.
    ///
    /// The returned error is the last one observed.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt, e.retry_after());
                    tracing::warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Await `fut`, converting an elapsed deadline into a transient error.
pub async fn with_timeout<T>(
    what: &str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(Error::TransientNetwork(format!(
            "{what} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: false,
        };
        assert_eq!(p.delay_for(0, None), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, None), Duration::from_millis(400));
        assert_eq!(p.delay_for(9, None), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let p = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 200,
            jitter: true,
        };
        for _ in 0..50 {
            let d = p.delay_for(1, None).as_millis();
            assert!((100..=200).contains(&d));
        }
    }

    #[test]
    fn server_hint_wins_when_longer() {
        let p = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 5_000,
            jitter: false,
        };
        assert_eq!(
            p.delay_for(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }

    #[tokio::test]
    async fn run_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = RetryPolicy::immediate(3)
            .run("op", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::TransientNetwork("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn run_does_not_retry_fatal_errors() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::immediate(5)
            .run("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::PermanentSource("404".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermanentSource(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::immediate(3)
            .run("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::TransientNetwork("down".into())) }
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_maps_to_transient() {
        let err = with_timeout("slow", Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
    }
}

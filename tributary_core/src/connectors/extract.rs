use crate::connectors::models::{Checkpoint, RawRecord};
use crate::connectors::traits::SourceConnector;
use crate::entities::models::EntityKey;
use crate::retry::{with_timeout, RetryPolicy};
use crate::{Error, ErrorClass, Result};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct ExtractSettings {
    pub batch_size: usize,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractOutcome {
    pub records: u64,
    /// Last checkpoint the connector emitted during this run.
    pub last_checkpoint: Option<Checkpoint>,
    /// Number of times the stream was reopened after a recoverable failure.
    pub resumes: u32,
}

/// Drives a connector to exhaustion, pushing record batches into `tx`.
///
/// Recoverable failures reopen the stream from the last checkpoint seen in this
/// run (or `since` if none); keys already delivered are not forwarded twice.
/// Cancellation is observed between batches only.
#[tracing::instrument(level = "debug", skip_all, fields(connector_type = connector.connector_type()))]
pub async fn run_extraction(
    connector: Arc<dyn SourceConnector>,
    since: Option<Checkpoint>,
    settings: ExtractSettings,
    tx: mpsc::Sender<Vec<RawRecord>>,
    cancel: CancellationToken,
) -> Result<ExtractOutcome> {
    let mut outcome = ExtractOutcome::default();
    let mut delivered: HashSet<EntityKey> = HashSet::new();
    let mut failures = 0u32;
    let mut refreshed = false;
    let mut resume_from = since.clone();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("extraction cancelled".to_string()));
        }

        let opened = with_timeout(
            "connector.extract",
            settings.call_timeout,
            connector.extract(resume_from.clone()),
        )
        .await;
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => {
                recover(&*connector, e, &settings, &mut failures, &mut refreshed).await?;
                outcome.resumes += 1;
                continue;
            }
        };

        let mut batch = Vec::with_capacity(settings.batch_size);
        let failure = loop {
            let next = with_timeout("connector.next", settings.call_timeout, async {
                Ok(stream.next().await)
            })
            .await;
            match next {
                Ok(Some(Ok(record))) => {
                    if let Some(cp) = &record.checkpoint {
                        outcome.last_checkpoint = Some(cp.clone());
                    }
                    if !delivered.insert(record.key()) {
                        continue;
                    }
                    outcome.records += 1;
                    batch.push(record);
                    if batch.len() >= settings.batch_size {
                        send_batch(&tx, &cancel, std::mem::take(&mut batch)).await?;
                    }
                }
                Ok(Some(Err(e))) | Err(e) => break Some(e),
                Ok(None) => break None,
            }
        };

        if !batch.is_empty() {
            send_batch(&tx, &cancel, batch).await?;
        }

        match failure {
            None => {
                tracing::debug!(
                    records = outcome.records,
                    resumes = outcome.resumes,
                    "extraction finished"
                );
                return Ok(outcome);
            }
            Some(e) => {
                recover(&*connector, e, &settings, &mut failures, &mut refreshed).await?;
                outcome.resumes += 1;
                resume_from = outcome.last_checkpoint.clone().or_else(|| since.clone());
            }
        }
    }
}

async fn send_batch(
    tx: &mpsc::Sender<Vec<RawRecord>>,
    cancel: &CancellationToken,
    batch: Vec<RawRecord>,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled("extraction cancelled".to_string()));
    }
    tx.send(batch)
        .await
        .map_err(|_| Error::Cancelled("record consumer stopped".to_string()))
}

/// Decide whether a failed extraction may be retried; sleeps for the backoff when it may.
async fn recover(
    connector: &dyn SourceConnector,
    err: Error,
    settings: &ExtractSettings,
    failures: &mut u32,
    refreshed: &mut bool,
) -> Result<()> {
    match err.class() {
        ErrorClass::Transient => {
            *failures += 1;
            if *failures >= settings.retry.max_attempts {
                tracing::warn!(error = %err, failures = *failures, "connector retry budget exhausted");
                return Err(err);
            }
            let delay = settings.retry.delay_for(*failures - 1, err.retry_after());
            tracing::warn!(
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "connector call failed; resuming from last checkpoint"
            );
            tokio::time::sleep(delay).await;
            Ok(())
        }
        ErrorClass::Auth if !*refreshed => {
            *refreshed = true;
            tracing::info!(error = %err, "source credentials expired; refreshing once");
            connector.refresh_credentials().await.map_err(|e| match e {
                Error::AuthExpired(m) => Error::AuthExpired(m),
                other => Error::AuthExpired(format!("credential refresh failed: {other}")),
            })
        }
        _ => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::models::ConnectorCapabilities;
    use crate::connectors::traits::RecordStream;
    use crate::entities::schema::EntitySchema;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Fails once with `first_error` after emitting `fail_after` records.
    struct Flaky {
        records: Vec<RawRecord>,
        fail_after: usize,
        first_error: Mutex<Option<Error>>,
        opens: Mutex<Vec<Option<Checkpoint>>>,
        refreshable: bool,
    }

    impl Flaky {
        fn new(n: usize, fail_after: usize, err: Option<Error>) -> Self {
            let records = (0..n)
                .map(|i| {
                    RawRecord::new("item", format!("{i}"), json!({"n": i}))
                        .unwrap()
                        .with_checkpoint(Checkpoint::new(json!(i)))
                })
                .collect();
            Self {
                records,
                fail_after,
                first_error: Mutex::new(err),
                opens: Mutex::new(Vec::new()),
                refreshable: false,
            }
        }
    }

    #[async_trait]
    impl SourceConnector for Flaky {
        fn connector_type(&self) -> &str {
            "flaky"
        }
        fn capabilities(&self) -> ConnectorCapabilities {
            ConnectorCapabilities {
                supports_incremental: true,
                lists_unchanged: false,
            }
        }
        fn schemas(&self) -> Vec<EntitySchema> {
            vec![EntitySchema::new("item")]
        }
        async fn extract(&self, since: Option<Checkpoint>) -> Result<RecordStream> {
            self.opens.lock().unwrap().push(since.clone());
            // Resume re-emits the checkpointed record itself to exercise de-duplication.
            let start = since
                .and_then(|c| c.value.as_u64())
                .map(|v| v as usize)
                .unwrap_or(0);
            let mut items: Vec<Result<RawRecord>> =
                self.records[start..].iter().cloned().map(Ok).collect();
            if let Some(e) = self.first_error.lock().unwrap().take() {
                let at = self.fail_after.saturating_sub(start).min(items.len());
                items.truncate(at);
                items.push(Err(e));
            }
            Ok(futures_util::stream::iter(items).boxed())
        }
        async fn refresh_credentials(&self) -> Result<()> {
            if self.refreshable {
                Ok(())
            } else {
                Err(Error::AuthExpired("no refresh token".into()))
            }
        }
    }

    fn settings(batch_size: usize) -> ExtractSettings {
        ExtractSettings {
            batch_size,
            call_timeout: Duration::from_secs(5),
            retry: RetryPolicy::immediate(3),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<Vec<RawRecord>>) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(batch) = rx.recv().await {
            ids.extend(batch.into_iter().map(|r| r.entity_id));
        }
        ids
    }

    #[tokio::test]
    async fn batches_and_reports_last_checkpoint() {
        let c = Arc::new(Flaky::new(5, 0, None));
        let (tx, rx) = mpsc::channel(8);
        let collector = tokio::spawn(drain(rx));
        let out = run_extraction(c, None, settings(2), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.records, 5);
        assert_eq!(out.last_checkpoint, Some(Checkpoint::new(json!(4))));
        assert_eq!(collector.await.unwrap(), vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn transient_failure_resumes_from_checkpoint_without_duplicates() {
        let c = Arc::new(Flaky::new(
            6,
            3,
            Some(Error::TransientNetwork("reset".into())),
        ));
        let (tx, rx) = mpsc::channel(8);
        let collector = tokio::spawn(drain(rx));
        let out = run_extraction(c.clone(), None, settings(10), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.resumes, 1);
        assert_eq!(out.records, 6);
        assert_eq!(collector.await.unwrap(), vec!["0", "1", "2", "3", "4", "5"]);
        let opens = c.opens.lock().unwrap().clone();
        assert_eq!(opens, vec![None, Some(Checkpoint::new(json!(2)))]);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let c = Arc::new(Flaky::new(
            4,
            1,
            Some(Error::PermanentSource("gone".into())),
        ));
        let (tx, rx) = mpsc::channel(8);
        let collector = tokio::spawn(drain(rx));
        let err = run_extraction(c.clone(), None, settings(10), tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermanentSource(_)));
        assert_eq!(c.opens.lock().unwrap().len(), 1);
        // Records before the failure were still handed over.
        assert_eq!(collector.await.unwrap(), vec!["0"]);
    }

    #[tokio::test]
    async fn auth_expired_refreshes_once_then_retries() {
        let mut flaky = Flaky::new(3, 0, Some(Error::AuthExpired("token".into())));
        flaky.refreshable = true;
        let c = Arc::new(flaky);
        let (tx, rx) = mpsc::channel(8);
        let collector = tokio::spawn(drain(rx));
        let out = run_extraction(c, None, settings(10), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.records, 3);
        assert_eq!(collector.await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn auth_expired_without_refresh_fails() {
        let c = Arc::new(Flaky::new(3, 0, Some(Error::AuthExpired("token".into()))));
        let (tx, _rx) = mpsc::channel(8);
        let err = run_extraction(c, None, settings(10), tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthExpired(_)));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_opening() {
        let c = Arc::new(Flaky::new(3, 0, None));
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_extraction(c, None, settings(10), tx, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}

//! Worker side of the background trigger: drains the raw operation store when
//! woken and reports per-operation outcomes back to the page.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::background::BackgroundError;
use super::backoff::RetryPolicy;
use super::operations::{RawOperation, RawOperationStore};
use crate::transport::{OutboundRequest, SendOptions, Transport};

/// Messages exchanged between the page and the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Page asks an active worker to flush now.
    QueueSync,
    /// A registered background wake fired.
    Wake { tag: String },
    /// Worker reports what happened during a flush.
    SyncComplete { results: Vec<SyncResult> },
}

/// Anything other than `success` on the wire counts as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SyncStatus {
    Success,
    Failure,
}

impl From<String> for SyncStatus {
    fn from(status: String) -> Self {
        if status == "success" {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

impl From<SyncStatus> for String {
    fn from(status: SyncStatus) -> Self {
        match status {
            SyncStatus::Success => "success".into(),
            SyncStatus::Failure => "failure".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub status: SyncStatus,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    fn success(id: i64) -> Self {
        Self {
            status: SyncStatus::Success,
            id: Some(id),
            error: None,
        }
    }

    fn failure(id: i64, error: String) -> Self {
        Self {
            status: SyncStatus::Failure,
            id: Some(id),
            error: Some(error),
        }
    }
}

/// Count `(successful, failed)` in a completion report.
pub fn tally(results: &[SyncResult]) -> (usize, usize) {
    let successful = results
        .iter()
        .filter(|r| r.status == SyncStatus::Success)
        .count();
    (successful, results.len() - successful)
}

pub struct BackgroundWorker {
    store: RawOperationStore,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl BackgroundWorker {
    pub fn new(store: RawOperationStore, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            store,
            transport,
            retry,
        }
    }

    /// Send every stored operation once. Failures stay in the store until
    /// their retry count reaches the policy's attempt limit.
    pub async fn drain(&self) -> Result<Vec<SyncResult>, BackgroundError> {
        let (ops, unreadable) = self.store.scan().await?;
        let mut results = Vec::with_capacity(ops.len() + unreadable.len());

        for bad in unreadable {
            self.store.delete(bad.id).await?;
            tracing::warn!("Background operation {} dropped, unreadable: {}", bad.id, bad.reason);
            results.push(SyncResult::failure(bad.id, bad.reason));
        }

        for op in ops {
            let id = op.id;
            match self.send(op).await {
                Ok(()) => {
                    self.store.delete(id).await?;
                    results.push(SyncResult::success(id));
                }
                Err(error) => {
                    let retries = self.store.record_failure(id).await?;
                    if self.retry.is_exhausted(retries) {
                        self.store.delete(id).await?;
                        tracing::warn!(
                            "Background operation {} dropped after {} attempts: {}",
                            id,
                            retries,
                            error
                        );
                    } else {
                        tracing::debug!("Background operation {} failed (retry {}): {}", id, retries, error);
                    }
                    results.push(SyncResult::failure(id, error));
                }
            }
        }

        Ok(results)
    }

    async fn send(&self, op: RawOperation) -> Result<(), String> {
        let request = OutboundRequest {
            endpoint: op.url,
            method: op.method,
            headers: op.headers,
            body: op.body,
        };
        self.transport
            .send(request, SendOptions::from_queue())
            .await
            .map_err(|e| e.to_string())
    }

    /// Run the worker until the page side hangs up. Each wake drains the store
    /// and replies with `SYNC_COMPLETE`.
    pub fn spawn(
        self,
        mut inbox: mpsc::Receiver<WorkerMessage>,
        outbox: mpsc::Sender<WorkerMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                match message {
                    WorkerMessage::QueueSync => tracing::debug!("Worker asked to sync"),
                    WorkerMessage::Wake { tag } => tracing::debug!("Worker woken by {}", tag),
                    WorkerMessage::SyncComplete { .. } => continue,
                }

                let results = match self.drain().await {
                    Ok(results) => results,
                    Err(e) => {
                        tracing::error!("Background drain failed: {}", e);
                        continue;
                    }
                };

                let (successful, failed) = tally(&results);
                tracing::info!("Background sync: {} sent, {} failed", successful, failed);

                if outbox
                    .send(WorkerMessage::SyncComplete { results })
                    .await
                    .is_err()
                {
                    tracing::debug!("Page side closed, stopping worker");
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::types::{Headers, Method};
    use crate::transport::TransportError;
    use async_trait::async_trait;

    struct FailingFor(String);

    #[async_trait]
    impl Transport for FailingFor {
        async fn send(&self, request: OutboundRequest, options: SendOptions) -> Result<(), TransportError> {
            assert!(options.skip_queue);
            if request.endpoint == self.0 {
                Err(TransportError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    async fn setup(bad_url: &str, max_attempts: u32) -> (RawOperationStore, BackgroundWorker) {
        let store = RawOperationStore::new(Arc::new(Database::in_memory().await.unwrap()));
        let worker = BackgroundWorker::new(
            store.clone(),
            Arc::new(FailingFor(bad_url.to_string())),
            RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            },
        );
        (store, worker)
    }

    #[test]
    fn test_message_wire_format() {
        let json = serde_json::to_value(WorkerMessage::QueueSync).unwrap();
        assert_eq!(json, serde_json::json!({"type": "QUEUE_SYNC"}));

        let complete: WorkerMessage = serde_json::from_str(
            r#"{"type":"SYNC_COMPLETE","results":[{"status":"success","id":1},{"status":"timeout"}]}"#,
        )
        .unwrap();
        let WorkerMessage::SyncComplete { results } = complete else {
            panic!("expected SYNC_COMPLETE");
        };
        assert_eq!(results[1].status, SyncStatus::Failure);
        assert_eq!(tally(&results), (1, 1));
    }

    #[tokio::test]
    async fn test_drain_deletes_successes_and_counts_failures() {
        let (store, worker) = setup("/api/broken", 3).await;
        store
            .push("/api/ok", Method::Post, &Headers::new(), Some("{}"))
            .await
            .unwrap();
        let bad = store
            .push("/api/broken", Method::Put, &Headers::new(), Some("{}"))
            .await
            .unwrap();

        let results = worker.drain().await.unwrap();
        assert_eq!(tally(&results), (1, 1));
        assert_eq!(
            results[1].error.as_deref(),
            Some("Network unavailable: connection refused")
        );

        let remaining = store.get_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, bad);
        assert_eq!(remaining[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_drain_evicts_at_attempt_limit() {
        let (store, worker) = setup("/api/broken", 2).await;
        store
            .push("/api/broken", Method::Delete, &Headers::new(), None)
            .await
            .unwrap();

        worker.drain().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        worker.drain().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_drops_unreadable_and_sends_the_rest() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        sqlx::query(
            "INSERT INTO sync_operations (url, method, headers, body, timestamp, retry_count) VALUES ('/api/x', 'BREW', '[]', NULL, 0, 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();
        let store = RawOperationStore::new(db);
        let worker = BackgroundWorker::new(
            store.clone(),
            Arc::new(FailingFor("/api/broken".into())),
            RetryPolicy::default(),
        );
        store
            .push("/api/ok", Method::Post, &Headers::new(), None)
            .await
            .unwrap();

        let results = worker.drain().await.unwrap();
        assert_eq!(tally(&results), (1, 1));
        assert!(results[0].error.as_deref().unwrap().contains("BREW"));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_worker_replies_sync_complete() {
        let (store, worker) = setup("/api/broken", 5).await;
        store
            .push("/api/ok", Method::Post, &Headers::new(), None)
            .await
            .unwrap();

        let (to_worker, inbox) = mpsc::channel(8);
        let (outbox, mut from_worker) = mpsc::channel(8);
        let handle = worker.spawn(inbox, outbox);

        to_worker.send(WorkerMessage::QueueSync).await.unwrap();
        let reply = from_worker.recv().await.unwrap();
        let WorkerMessage::SyncComplete { results } = reply else {
            panic!("expected SYNC_COMPLETE");
        };
        assert_eq!(tally(&results), (1, 0));

        drop(to_worker);
        handle.await.unwrap();
    }
}

//! Background trigger coordinator.
//!
//! Page-side half of the out-of-foreground flush path: appends raw
//! operations for the worker and asks the host to wake it. Retrying is the
//! worker's job; this side only summarises what the worker reports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::operations::RawOperationStore;
use super::types::{Body, Headers, Method, QueueError};
use super::worker::{tally, WorkerMessage};
use crate::events::{EventBus, SyncEvent};
use crate::network::NetworkMonitor;

/// Tag registered with the background-wake primitive.
pub const SYNC_TAG: &str = "sync-queue";

#[derive(Error, Debug)]
pub enum BackgroundError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Validation(#[from] QueueError),

    #[error("Corrupted operation: {0}")]
    Corrupted(String),

    #[error("Background wake unavailable: {0}")]
    WakeUnavailable(String),
}

/// Host primitive that can wake the worker later, even with the page gone.
#[async_trait]
pub trait BackgroundWake: Send + Sync {
    async fn register(&self, tag: &str) -> Result<(), BackgroundError>;
}

/// In-process wake: tags registered while offline fire once the network
/// monitor reports the host back online.
pub struct ConnectivityWake {
    network: Arc<NetworkMonitor>,
    worker: mpsc::Sender<WorkerMessage>,
    pending: Arc<Mutex<BTreeSet<String>>>,
}

impl ConnectivityWake {
    pub fn new(network: Arc<NetworkMonitor>, worker: mpsc::Sender<WorkerMessage>) -> Self {
        Self {
            network,
            worker,
            pending: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Fire pending tags on every offline to online transition.
    pub fn spawn(&self) -> JoinHandle<()> {
        let mut rx = self.network.subscribe();
        let pending = self.pending.clone();
        let worker = self.worker.clone();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online && fire(&pending, &worker).await.is_err() {
                    break;
                }
            }
        })
    }

    pub async fn pending_tags(&self) -> Vec<String> {
        self.pending.lock().await.iter().cloned().collect()
    }
}

async fn fire(
    pending: &Mutex<BTreeSet<String>>,
    worker: &mpsc::Sender<WorkerMessage>,
) -> Result<(), BackgroundError> {
    let tags = std::mem::take(&mut *pending.lock().await);
    for tag in tags {
        tracing::debug!("Firing background wake {}", tag);
        worker
            .send(WorkerMessage::Wake { tag })
            .await
            .map_err(|_| BackgroundError::WakeUnavailable("worker stopped".into()))?;
    }
    Ok(())
}

#[async_trait]
impl BackgroundWake for ConnectivityWake {
    async fn register(&self, tag: &str) -> Result<(), BackgroundError> {
        if self.worker.is_closed() {
            return Err(BackgroundError::WakeUnavailable("worker stopped".into()));
        }
        self.pending.lock().await.insert(tag.to_string());
        if self.network.is_online() {
            fire(&self.pending, &self.worker).await?;
        }
        Ok(())
    }
}

/// Request shape accepted by [`BackgroundSyncCoordinator::queue_operation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Body>,
}

impl RequestOptions {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(Body::Json(value));
        self
    }
}

/// How a background sync request was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Registered,
    Messaged,
    Unsupported,
}

pub struct BackgroundSyncCoordinator {
    store: RawOperationStore,
    wake: Option<Arc<dyn BackgroundWake>>,
    worker: Option<mpsc::Sender<WorkerMessage>>,
    events: EventBus,
}

impl BackgroundSyncCoordinator {
    pub fn new(store: RawOperationStore, events: EventBus) -> Self {
        Self {
            store,
            wake: None,
            worker: None,
            events,
        }
    }

    pub fn with_wake(mut self, wake: Arc<dyn BackgroundWake>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Channel to an already running worker, used when no wake primitive exists.
    pub fn with_worker(mut self, worker: mpsc::Sender<WorkerMessage>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Whether the host can wake the worker on its own. When it cannot,
    /// callers should rely on foreground flushing.
    pub fn is_supported(&self) -> bool {
        self.wake.is_some()
    }

    pub fn store(&self) -> &RawOperationStore {
        &self.store
    }

    /// Store a raw operation for the worker and request a wake.
    pub async fn queue_operation(&self, url: &str, options: RequestOptions) -> Result<i64, BackgroundError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(QueueError::Validation("url is required".into()).into());
        }
        let method: Method = options.method.parse()?;
        let mut headers = Headers::normalized(options.headers);
        if matches!(options.body, Some(Body::Json(_))) && !headers.contains("content-type") {
            headers.set("Content-Type", "application/json");
        }
        let body = options.body.as_ref().map(Body::to_wire).transpose()?;

        let id = self.store.push(url, method, &headers, body.as_deref()).await?;
        tracing::info!("Stored background operation {} for {} {}", id, method, url);

        self.request_background_sync().await;
        Ok(id)
    }

    /// Best effort: register a wake, else message a live worker, else nothing.
    pub async fn request_background_sync(&self) -> SyncTrigger {
        if let Some(wake) = &self.wake {
            match wake.register(SYNC_TAG).await {
                Ok(()) => {
                    tracing::debug!("Registered background wake {}", SYNC_TAG);
                    return SyncTrigger::Registered;
                }
                Err(e) => tracing::warn!("Background wake registration failed: {}", e),
            }
        }

        if let Some(worker) = &self.worker {
            if worker.send(WorkerMessage::QueueSync).await.is_ok() {
                tracing::debug!("Asked running worker to sync");
                return SyncTrigger::Messaged;
            }
            tracing::warn!("Background worker is gone");
        }

        tracing::debug!("No background sync available, relying on foreground flush");
        SyncTrigger::Unsupported
    }

    /// Summarise a worker completion into one `synced` event.
    pub fn handle_worker_message(&self, message: &WorkerMessage) -> Option<(usize, usize)> {
        let WorkerMessage::SyncComplete { results } = message else {
            return None;
        };
        let (successful, failed) = tally(results);
        tracing::info!("Background sync complete: {} successful, {} failed", successful, failed);
        self.events.emit(SyncEvent::Synced { successful, failed });
        Some((successful, failed))
    }

    /// Consume worker replies until the worker side closes its channel.
    pub fn spawn_listener(self: &Arc<Self>, mut replies: mpsc::Receiver<WorkerMessage>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(message) = replies.recv().await {
                coordinator.handle_worker_message(&message);
            }
        })
    }
}

//! Fire-and-forget lifecycle notifications.
//!
//! Hosts either register a callback with [`EventBus::on`] or take a
//! broadcast receiver with [`EventBus::subscribe`] for async consumers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Queued {
        id: String,
        endpoint: String,
        method: String,
    },
    Processed {
        id: String,
        endpoint: String,
        method: String,
    },
    Error {
        id: String,
        endpoint: String,
        method: String,
        attempts: u32,
        error: String,
    },
    Discarded {
        id: String,
        endpoint: String,
        method: String,
        attempts: u32,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    Ready {
        db_name: String,
        store_name: String,
    },
    Empty,
    Online,
    Offline,
    /// A background worker reported the outcome of a wake-up.
    Synced {
        successful: usize,
        failed: usize,
    },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Processed { .. } => "processed",
            Self::Error { .. } => "error",
            Self::Discarded { .. } => "discarded",
            Self::Ready { .. } => "ready",
            Self::Empty => "empty",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Synced { .. } => "synced",
        }
    }
}

pub type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Inner {
    sender: broadcast::Sender<SyncEvent>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

/// Cheap to clone; all clones share the same listeners.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                sender,
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.inner.listeners.write() {
            listeners.push((id, Arc::new(listener)));
        }
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        match self.inner.listeners.write() {
            Ok(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|(lid, _)| *lid != id);
                listeners.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.sender.subscribe()
    }

    /// Deliver `event` to every listener. Never fails; nobody listening is fine.
    pub fn emit(&self, event: SyncEvent) {
        tracing::debug!("Emitting {} event", event.name());

        // Snapshot so a listener may register or remove listeners re-entrantly.
        let listeners: Vec<Listener> = match self.inner.listeners.read() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => Vec::new(),
        };
        for listener in listeners {
            listener(&event);
        }

        let _ = self.inner.sender.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().map(|l| l.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

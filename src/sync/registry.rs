//! One queue per store name.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::queue::SyncQueue;
use super::types::QueueError;
use crate::config::QueueConfig;
use crate::events::EventBus;
use crate::network::NetworkMonitor;
use crate::transport::Transport;

/// Owns every open [`SyncQueue`], keyed by store name. A store is only ever
/// driven by a single queue instance.
pub struct QueueRegistry {
    queues: Mutex<HashMap<String, Arc<SyncQueue>>>,
    transport: Option<Arc<dyn Transport>>,
    network: Arc<NetworkMonitor>,
    events: EventBus,
}

impl QueueRegistry {
    pub fn new(
        transport: Option<Arc<dyn Transport>>,
        network: Arc<NetworkMonitor>,
        events: EventBus,
    ) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            transport,
            network,
            events,
        }
    }

    /// Return the queue for `config.store.store_name`, opening it on first use.
    /// Asking for an open store name under a different database is refused.
    pub async fn get_or_init(&self, config: QueueConfig) -> Result<Arc<SyncQueue>, QueueError> {
        let mut queues = self.queues.lock().await;
        let key = config.store.store_name.clone();

        if let Some(existing) = queues.get(&key) {
            let open = &existing.config().store;
            if open.name != config.store.name || open.data_dir != config.store.data_dir {
                return Err(QueueError::Validation(format!(
                    "store {} is already owned by database {}",
                    key, open.name
                )));
            }
            return Ok(existing.clone());
        }

        let queue = SyncQueue::open(
            config,
            self.transport.clone(),
            self.network.clone(),
            self.events.clone(),
        )
        .await?;
        tracing::info!("Opened sync queue for store {}", key);
        queues.insert(key, queue.clone());
        Ok(queue)
    }

    pub async fn get(&self, store_name: &str) -> Option<Arc<SyncQueue>> {
        self.queues.lock().await.get(store_name).cloned()
    }

    pub async fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop a queue from the registry, cancelling its pending timer.
    pub async fn remove(&self, store_name: &str) -> bool {
        let removed = self.queues.lock().await.remove(store_name);
        match removed {
            Some(queue) => {
                queue.cancel_scheduled_flush().await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn registry() -> QueueRegistry {
        let events = EventBus::new();
        let network = Arc::new(NetworkMonitor::new(true, events.clone()));
        QueueRegistry::new(None, network, events)
    }

    fn config(dir: &std::path::Path, db: &str, store: &str) -> QueueConfig {
        QueueConfig {
            store: StoreConfig {
                name: db.into(),
                store_name: store.into(),
                data_dir: Some(dir.to_path_buf()),
                ..StoreConfig::default()
            },
            auto_flush: false,
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn test_same_store_returns_same_queue() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();

        let a = registry.get_or_init(config(dir.path(), "app", "operations")).await.unwrap();
        let b = registry.get_or_init(config(dir.path(), "app", "operations")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        registry.get_or_init(config(dir.path(), "app", "drafts")).await.unwrap();
        assert_eq!(registry.store_names().await, vec!["drafts", "operations"]);
    }

    #[tokio::test]
    async fn test_second_owner_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();

        registry.get_or_init(config(dir.path(), "app", "operations")).await.unwrap();
        let err = registry
            .get_or_init(config(dir.path(), "other", "operations"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        registry.get_or_init(config(dir.path(), "app", "operations")).await.unwrap();

        assert!(registry.remove("operations").await);
        assert!(!registry.remove("operations").await);
        assert!(registry.get("operations").await.is_none());
    }
}

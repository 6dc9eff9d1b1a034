//! Sync queue for offline mutation support.
//!
//! Persists mutating requests that could not be delivered and replays them
//! through the configured [`Transport`] once the network is back, with
//! exponential backoff and eviction after a bounded number of attempts.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::metadata::{self, SyncContext};
use super::store::{CorruptRecord, QueueStore, StoreScan};
use super::types::{
    Body, EnqueueRequest, FlushReport, Headers, Method, QueueError, QueuedOperation,
};
use crate::config::{FailureMode, QueueConfig};
use crate::crypto::HeaderCipher;
use crate::events::{EventBus, SyncEvent};
use crate::network::NetworkMonitor;
use crate::transport::{OutboundRequest, SendOptions, Transport};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct ScheduledFlush {
    generation: u64,
    due_at: i64,
    handle: JoinHandle<()>,
}

pub struct SyncQueue {
    store: QueueStore,
    transport: Option<Arc<dyn Transport>>,
    network: Arc<NetworkMonitor>,
    events: EventBus,
    config: QueueConfig,
    flush_lock: Mutex<()>,
    timer: Mutex<Option<ScheduledFlush>>,
    generation: AtomicU64,
}

impl SyncQueue {
    /// Open the configured store and build a queue on top of it.
    pub async fn open(
        config: QueueConfig,
        transport: Option<Arc<dyn Transport>>,
        network: Arc<NetworkMonitor>,
        events: EventBus,
    ) -> Result<Arc<Self>, QueueError> {
        let mut store = QueueStore::init(&config.store).await?;
        if config.encrypt_headers && store.is_available() {
            store = store.with_cipher(HeaderCipher::from_keychain()?);
        }
        Ok(Self::new(store, config, transport, network, events))
    }

    pub fn new(
        store: QueueStore,
        config: QueueConfig,
        transport: Option<Arc<dyn Transport>>,
        network: Arc<NetworkMonitor>,
        events: EventBus,
    ) -> Arc<Self> {
        if store.is_available() {
            events.emit(SyncEvent::Ready {
                db_name: store.db_name().to_string(),
                store_name: store.store_name().to_string(),
            });
        } else {
            tracing::warn!(
                "Sync queue {} has no persistent storage, mutations will not be retried",
                store.store_name()
            );
        }

        Arc::new(Self {
            store,
            transport,
            network,
            events,
            config,
            flush_lock: Mutex::new(()),
            timer: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn pending_count(&self) -> Result<usize, QueueError> {
        Ok(self.store.count().await?)
    }

    /// Validate, persist and schedule a mutation. Validation failures are the
    /// only errors callers see; nothing is stored when they occur.
    pub async fn enqueue(self: &Arc<Self>, request: EnqueueRequest) -> Result<QueuedOperation, QueueError> {
        let endpoint = request.endpoint.trim();
        if endpoint.is_empty() {
            return Err(QueueError::Validation("endpoint is required".into()));
        }
        let method: Method = request.method.parse()?;

        let mut headers = Headers::normalized(request.headers);
        let ctx = SyncContext::resolve(request.sync.as_ref(), &self.config.identity);

        let mut body = request.body;
        if let Some(json) = body.as_mut().filter(|b| matches!(b, Body::Json(_))) {
            metadata::embed(json, &ctx);
            if !headers.contains("content-type") {
                headers.set("Content-Type", "application/json");
            }
        }

        let now = now_ms();
        let op = QueuedOperation {
            id: ctx.op_id,
            endpoint: endpoint.to_string(),
            method,
            headers,
            body,
            queued_at: now,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
        };

        if self.store.is_available() {
            self.store.put(&op).await?;
            tracing::info!("Queued {} {} as {}", op.method, op.endpoint, op.id);
        } else {
            tracing::warn!(
                "Queued {} {} as {} without persistent storage, it will not be flushed",
                op.method,
                op.endpoint,
                op.id
            );
        }

        self.events.emit(SyncEvent::Queued {
            id: op.id.clone(),
            endpoint: op.endpoint.clone(),
            method: op.method.to_string(),
        });

        if self.config.auto_flush && self.store.is_available() {
            self.schedule_flush(0).await;
        }

        Ok(op)
    }

    /// Run one flush pass. Returns straight away with the pending count when
    /// another pass is already running.
    pub async fn process_queue(self: &Arc<Self>) -> Result<FlushReport, QueueError> {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            let pending = self.store.count().await?;
            tracing::debug!("Flush already in progress, {} pending", pending);
            return Ok(FlushReport {
                processed: 0,
                pending,
            });
        };

        if !self.store.is_available() {
            tracing::warn!("Skipping flush of {}: no persistent storage", self.store.store_name());
            return Ok(FlushReport::default());
        }

        let Some(transport) = self.transport.clone() else {
            let pending = self.store.count().await?;
            tracing::warn!("No transport configured, {} operations left queued", pending);
            return Ok(FlushReport {
                processed: 0,
                pending,
            });
        };

        let started = self.generation.load(Ordering::SeqCst);
        let StoreScan { records, corrupt } = self.store.scan().await?;
        for bad in corrupt {
            self.discard_unreadable(bad).await?;
        }

        let policy = &self.config.retry;
        let mut processed = 0;

        for mut record in records {
            if !record.is_due(now_ms()) {
                tracing::debug!("{} not due until {}", record.id, record.next_attempt_at);
                continue;
            }

            if !self.network.is_online() {
                let pending = self.store.count().await?;
                tracing::info!("Offline, pausing flush with {} pending", pending);
                if self.config.auto_flush {
                    self.schedule_flush(policy.base_delay_ms).await;
                }
                return Ok(FlushReport { processed, pending });
            }

            if let Some(body) = record.body.as_mut() {
                metadata::restamp(body, &record.id, &self.config.identity);
            }

            let request = OutboundRequest {
                endpoint: record.endpoint.clone(),
                method: record.method,
                headers: record.headers.clone(),
                body: record.body.as_ref().map(Body::to_wire).transpose()?,
            };

            match transport.send(request, SendOptions::from_queue()).await {
                Ok(()) => {
                    self.store.delete(&record.id).await?;
                    processed += 1;
                    tracing::info!("Delivered {} {} ({})", record.method, record.endpoint, record.id);
                    self.events.emit(SyncEvent::Processed {
                        id: record.id,
                        endpoint: record.endpoint,
                        method: record.method.to_string(),
                    });
                }
                Err(e) => {
                    record.attempts += 1;
                    let error = e.to_string();
                    record.last_error = Some(error.clone());

                    if policy.is_exhausted(record.attempts) {
                        self.store.delete(&record.id).await?;
                        tracing::warn!(
                            "Discarding {} {} ({}) after {} attempts: {}",
                            record.method,
                            record.endpoint,
                            record.id,
                            record.attempts,
                            error
                        );
                        self.events.emit(SyncEvent::Discarded {
                            id: record.id,
                            endpoint: record.endpoint,
                            method: record.method.to_string(),
                            attempts: record.attempts,
                            error,
                        });
                        continue;
                    }

                    let delay = policy.backoff_delay_ms(record.attempts);
                    record.next_attempt_at = now_ms() + delay as i64;
                    self.store.put(&record).await?;
                    tracing::warn!(
                        "Attempt {} for {} failed, retrying in {}ms: {}",
                        record.attempts,
                        record.id,
                        delay,
                        error
                    );
                    self.events.emit(SyncEvent::Error {
                        id: record.id,
                        endpoint: record.endpoint,
                        method: record.method.to_string(),
                        attempts: record.attempts,
                        error,
                    });

                    if self.config.failure_mode == FailureMode::StopPass {
                        break;
                    }
                }
            }
        }

        let remaining = self.store.get_all().await?;
        let pending = remaining.len();

        if pending == 0 {
            self.cancel_flush_unless_rearmed(started).await;
            self.events.emit(SyncEvent::Empty);
        } else if self.config.auto_flush {
            let now = now_ms();
            let earliest = remaining
                .iter()
                .map(|r| r.next_attempt_at)
                .min()
                .unwrap_or(now);
            let delay = (earliest - now).max(policy.base_delay_ms as i64) as u64;
            self.schedule_flush(delay).await;
        }

        tracing::info!("Flush complete: {} processed, {} pending", processed, pending);
        Ok(FlushReport { processed, pending })
    }

    /// Rows that no longer decode can never be sent; drop them and report
    /// them the same way as an exhausted record.
    async fn discard_unreadable(&self, bad: CorruptRecord) -> Result<(), QueueError> {
        self.store.delete(&bad.id).await?;
        tracing::warn!(
            "Discarding unreadable record {} ({} {}): {}",
            bad.id,
            bad.method,
            bad.endpoint,
            bad.reason
        );
        self.events.emit(SyncEvent::Discarded {
            id: bad.id,
            endpoint: bad.endpoint,
            method: bad.method,
            attempts: bad.attempts,
            error: bad.reason,
        });
        Ok(())
    }

    /// Arm the flush timer, replacing any timer already armed.
    pub async fn schedule_flush(self: &Arc<Self>, delay_ms: u64) {
        let weak: Weak<Self> = Arc::downgrade(self);

        let mut slot = self.timer.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(queue) = weak.upgrade() {
                queue.fire_scheduled(generation).await;
            }
        });

        tracing::debug!("Flush scheduled in {}ms", delay_ms);
        *slot = Some(ScheduledFlush {
            generation,
            due_at: now_ms() + delay_ms as i64,
            handle,
        });
    }

    pub async fn cancel_scheduled_flush(&self) {
        if let Some(previous) = self.timer.lock().await.take() {
            previous.handle.abort();
        }
    }

    /// Cancel the armed timer unless one was scheduled after `generation`.
    async fn cancel_flush_unless_rearmed(&self, generation: u64) -> bool {
        let mut slot = self.timer.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
        true
    }

    /// When the armed timer fires, if any.
    pub async fn scheduled_flush_at(&self) -> Option<i64> {
        self.timer.lock().await.as_ref().map(|t| t.due_at)
    }

    fn fire_scheduled(self: Arc<Self>, generation: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            {
                // Detach from the slot so re-arming from inside this flush
                // cannot abort the task running it.
                let mut slot = self.timer.lock().await;
                if slot.as_ref().is_some_and(|t| t.generation == generation) {
                    slot.take();
                }
            }

            // Let a pass that is already running finish instead of being
            // swallowed by the single-flush guard.
            drop(self.flush_lock.lock().await);

            if let Err(e) = self.process_queue().await {
                tracing::error!("Scheduled flush failed: {}", e);
                let delay = self.config.retry.backoff_delay_ms(1);
                self.schedule_flush(delay).await;
            }
        })
    }

    /// Flush whenever the network monitor reports the host back online.
    pub fn watch_connectivity(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let mut rx = self.network.subscribe();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if !online {
                    continue;
                }
                let Some(queue) = weak.upgrade() else {
                    break;
                };
                match queue.process_queue().await {
                    Ok(report) => tracing::info!(
                        "Back online: {} processed, {} pending",
                        report.processed,
                        report.pending
                    ),
                    Err(e) => tracing::error!("Flush after reconnect failed: {}", e),
                }
            }
        })
    }
}

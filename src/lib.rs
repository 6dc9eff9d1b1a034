//! Durable offline outbox for mutating HTTP requests.
//!
//! Requests that cannot be delivered are persisted in SQLite, replayed in
//! order once the network is back, retried with exponential backoff and
//! deduplicated server-side through an embedded `sync.op_id`.

pub mod analytics;
pub mod client;
pub mod config;
pub mod crypto;
pub mod db;
pub mod events;
pub mod network;
pub mod notifications;
pub mod sync;
pub mod transport;

pub use client::{Delivery, QueueingClient};
pub use config::QueueConfig;
pub use events::{EventBus, SyncEvent};
pub use sync::{EnqueueRequest, FlushReport, SyncQueue};

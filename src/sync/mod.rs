//! Offline mutation sync: the persistent queue, its flush engine, and the
//! background trigger path.

pub mod background;
pub mod backoff;
pub mod metadata;
pub mod operations;
pub mod queue;
pub mod registry;
pub mod store;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use background::{
    BackgroundError, BackgroundSyncCoordinator, BackgroundWake, ConnectivityWake, RequestOptions,
    SyncTrigger, SYNC_TAG,
};
pub use backoff::RetryPolicy;
pub use metadata::{SyncContext, SyncContextPatch};
pub use operations::{RawOperation, RawOperationStore};
pub use queue::SyncQueue;
pub use registry::QueueRegistry;
pub use store::{CorruptRecord, QueueStore, StoreScan};
pub use types::{
    Body, EnqueueRequest, FlushReport, Headers, Method, QueueError, QueuedOperation, StoreError,
};
pub use worker::{BackgroundWorker, SyncResult, SyncStatus, WorkerMessage};

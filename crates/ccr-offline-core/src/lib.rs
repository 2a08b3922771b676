//! Offline resilience core for the CCR mobile client.
//!
//! Keeps the app usable without a network: reads fall back to a TTL cache,
//! writes fall back to a durable FIFO queue, and a sync engine replays the
//! queue when connectivity returns.
//!
//! Platform concerns (persistence, the connectivity signal, the HTTP API)
//! come in through `KeyValueStore`, a `Stream<Item = bool>`, and `Backend`.

pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod operation;
pub mod queue;
pub mod storage;
pub mod sync;

pub use backend::{Backend, ErrorClass, HttpBackend, RemoteError};
pub use cache::{CacheEntry, CacheInfo, CacheStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{OfflineConfig, OrderingPolicy};
pub use connectivity::{ConnectivityObserver, SyncTrigger, Unsubscribe};
pub use context::OfflineContext;
pub use operation::{OfflineClient, OfflineError, Operation, Outcome};
pub use queue::{OfflineQueue, QueueId, QueueItem};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use sync::{
    QuarantineReason, SyncEngine, SyncOutcome, SyncReason, SyncReport, SyncStatus,
    TerminalFailure,
};

//! Persistent key-value storage used by the cache, the offline queue and the
//! sync marker.
//!
//! The host platform owns the real persistence primitive; this module only
//! defines the async contract the core needs from it, plus two backends:
//! - `MemoryStore`: process-local map, used by tests and ephemeral sessions
//! - `FileStore`: one JSON file per key, replaced atomically on write

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;

/// Key under which the offline queue is stored as a single serialized list.
pub const QUEUE_KEY: &str = "ccr_offline_queue";

/// Key holding the RFC 3339 timestamp of the last successful sync.
pub const LAST_SYNC_KEY: &str = "ccr_last_sync";

/// Prefix for every cache entry key.
pub const CACHE_PREFIX: &str = "ccr_cache_";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value stored at `key`. A reader never observes a partially
    /// written value.
    async fn set_item(&self, key: &str, value: &str) -> Result<()>;

    async fn remove_item(&self, key: &str) -> Result<()>;

    /// All keys currently stored, in no particular order.
    async fn keys(&self) -> Result<Vec<String>>;
}

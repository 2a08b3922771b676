//! Read-through cache with expiry.
//!
//! `CacheStore` keeps one JSON entry per logical resource under the
//! `ccr_cache_` prefix. Each entry records when it was written and when it
//! expires; reads past `expires_at` are misses, and the stale entry is evicted
//! lazily on that read.

pub mod store;

pub use store::{CacheEntry, CacheInfo, CacheStore};

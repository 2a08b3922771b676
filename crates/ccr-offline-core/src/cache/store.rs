use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::storage::{KeyValueStore, CACHE_PREFIX};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub data: T,
    pub written_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(key: impl Into<String>, data: T, written_at: DateTime<Utc>, ttl: Duration) -> Self {
        let expires_at = written_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key: key.into(),
            data,
            written_at,
            expires_at,
        }
    }

    /// Expired entries must read as misses whether or not they were evicted.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.written_at).num_minutes()
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age_minutes(now);
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

/// Approximate footprint of the cache namespace, for diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CacheInfo {
    pub entries: usize,
    pub expired: usize,
    pub bytes: usize,
}

/// Only the timestamps, so diagnostics can inspect entries of any payload type.
#[derive(Deserialize)]
struct EntryHeader {
    expires_at: DateTime<Utc>,
}

/// Namespaced read-through cache with per-entry TTL.
///
/// Entries live under `ccr_cache_<key>` in the injected store. The cache has
/// no idea why a value was cached and never touches the network.
pub struct CacheStore {
    storage: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl CacheStore {
    pub fn new(storage: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        Self {
            storage,
            clock,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn storage_key(key: &str) -> String {
        format!("{}{}", CACHE_PREFIX, key)
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(key, value, self.clock.now(), ttl);
        let contents = serde_json::to_string(&entry)
            .with_context(|| format!("Failed to serialize cache entry: {}", key))?;
        self.storage.set_item(&Self::storage_key(key), &contents).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        Ok(self.get_entry(key).await?.map(|entry| entry.data))
    }

    /// Like `get`, but keeps the timestamps for callers that display staleness.
    pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
        let storage_key = Self::storage_key(key);
        let Some(contents) = self.storage.get_item(&storage_key).await? else {
            debug!(key, "Cache miss");
            return Ok(None);
        };

        let entry: CacheEntry<serde_json::Value> = match serde_json::from_str(&contents) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "Dropping malformed cache entry");
                self.evict(&storage_key).await;
                return Ok(None);
            }
        };

        if entry.is_expired(self.clock.now()) {
            debug!(key, expires_at = %entry.expires_at, "Cache entry expired");
            self.evict(&storage_key).await;
            return Ok(None);
        }

        // A type mismatch is the caller's problem, not corruption: keep the entry
        let data: T = match serde_json::from_value(entry.data) {
            Ok(data) => data,
            Err(e) => {
                warn!(key, error = %e, "Cache entry does not match requested type");
                return Ok(None);
            }
        };
        let entry = CacheEntry {
            key: entry.key,
            data,
            written_at: entry.written_at,
            expires_at: entry.expires_at,
        };

        Ok(Some(entry))
    }

    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.storage.remove_item(&Self::storage_key(key)).await
    }

    /// Remove every entry in the cache namespace. Other keys in the store
    /// (queue, sync marker) are left alone.
    pub async fn clear_all(&self) -> Result<usize> {
        let keys = self.namespace_keys().await?;
        for key in &keys {
            self.storage.remove_item(key).await?;
        }
        debug!(removed = keys.len(), "Cache cleared");
        Ok(keys.len())
    }

    /// Physically remove expired and unreadable entries. Returns how many
    /// were removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut removed = 0;
        for key in self.namespace_keys().await? {
            let Some(contents) = self.storage.get_item(&key).await? else {
                continue;
            };
            let stale = match serde_json::from_str::<EntryHeader>(&contents) {
                Ok(header) => now >= header.expires_at,
                Err(_) => true,
            };
            if stale {
                self.storage.remove_item(&key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn storage_info(&self) -> Result<CacheInfo> {
        let now = self.clock.now();
        let mut info = CacheInfo::default();
        for key in self.namespace_keys().await? {
            let Some(contents) = self.storage.get_item(&key).await? else {
                continue;
            };
            info.entries += 1;
            info.bytes += key.len() + contents.len();
            match serde_json::from_str::<EntryHeader>(&contents) {
                Ok(header) if now < header.expires_at => {}
                _ => info.expired += 1,
            }
        }
        Ok(info)
    }

    async fn namespace_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(CACHE_PREFIX))
            .collect())
    }

    /// Best-effort removal; a failure here never turns a miss into an error.
    async fn evict(&self, storage_key: &str) {
        if let Err(e) = self.storage.remove_item(storage_key).await {
            debug!(key = storage_key, error = %e, "Failed to evict cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    fn setup() -> (CacheStore, Arc<MemoryStore>, Arc<ManualClock>) {
        let storage = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at_epoch());
        let cache = CacheStore::new(storage.clone(), clock.clone(), Duration::minutes(5));
        (cache, storage, clock)
    }

    #[tokio::test]
    async fn test_entry_served_until_expiry() {
        let (cache, _, clock) = setup();
        let types = vec!["A".to_string(), "B".to_string()];
        cache
            .put("types", &types, Duration::milliseconds(300_000))
            .await
            .unwrap();

        clock.set(DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(299_000));
        assert_eq!(cache.get::<Vec<String>>("types").await.unwrap(), Some(types));

        clock.set(DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(300_001));
        assert_eq!(cache.get::<Vec<String>>("types").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_exact_expiry_is_a_miss() {
        let (cache, _, clock) = setup();
        cache.put("k", &1u32, Duration::seconds(10)).await.unwrap();

        clock.advance(Duration::seconds(10));
        assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_evicted_on_read() {
        let (cache, storage, clock) = setup();
        cache.put("k", &1u32, Duration::seconds(1)).await.unwrap();
        clock.advance(Duration::seconds(2));

        assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
        assert_eq!(storage.get_item("ccr_cache_k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_overwrites_and_resets_expiry() {
        let (cache, _, clock) = setup();
        cache.put("k", &"old", Duration::seconds(10)).await.unwrap();
        clock.advance(Duration::seconds(8));
        cache.put("k", &"new", Duration::seconds(10)).await.unwrap();
        clock.advance(Duration::seconds(8));

        assert_eq!(cache.get::<String>("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_invalidate_removes_single_entry() {
        let (cache, _, _) = setup();
        cache.put("a", &1u32, Duration::minutes(1)).await.unwrap();
        cache.put("b", &2u32, Duration::minutes(1)).await.unwrap();

        cache.invalidate("a").await.unwrap();
        assert_eq!(cache.get::<u32>("a").await.unwrap(), None);
        assert_eq!(cache.get::<u32>("b").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_clear_all_leaves_other_namespaces() {
        let (cache, storage, _) = setup();
        storage.set_item("ccr_offline_queue", "[]").await.unwrap();
        cache.put("a", &1u32, Duration::minutes(1)).await.unwrap();
        cache.put("b", &2u32, Duration::minutes(1)).await.unwrap();

        assert_eq!(cache.clear_all().await.unwrap(), 2);
        assert_eq!(cache.storage_info().await.unwrap().entries, 0);
        assert!(storage.get_item("ccr_offline_queue").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_malformed_entry_is_a_miss_and_dropped() {
        let (cache, storage, _) = setup();
        storage.set_item("ccr_cache_bad", "{not json").await.unwrap();
        cache.put("good", &7u32, Duration::minutes(1)).await.unwrap();

        assert_eq!(cache.get::<u32>("bad").await.unwrap(), None);
        assert_eq!(storage.get_item("ccr_cache_bad").await.unwrap(), None);
        assert_eq!(cache.get::<u32>("good").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_wrong_type_read_keeps_entry() {
        let (cache, storage, _) = setup();
        cache.put("greeting", &"hello", Duration::minutes(1)).await.unwrap();

        assert_eq!(cache.get::<u32>("greeting").await.unwrap(), None);
        assert!(storage.get_item("ccr_cache_greeting").await.unwrap().is_some());
        assert_eq!(
            cache.get::<String>("greeting").await.unwrap().as_deref(),
            Some("hello")
        );
    }

    #[tokio::test]
    async fn test_storage_info_and_purge() {
        let (cache, _, clock) = setup();
        cache.put("short", &1u32, Duration::seconds(1)).await.unwrap();
        cache.put("long", &2u32, Duration::hours(1)).await.unwrap();
        clock.advance(Duration::seconds(5));

        let info = cache.storage_info().await.unwrap();
        assert_eq!(info.entries, 2);
        assert_eq!(info.expired, 1);
        assert!(info.bytes > 0);

        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.storage_info().await.unwrap().entries, 1);
    }

    #[test]
    fn test_age_display() {
        let start = DateTime::<Utc>::UNIX_EPOCH;
        let entry = CacheEntry::new("k", (), start, Duration::days(7));
        assert_eq!(entry.age_display(start), "just now");
        assert_eq!(entry.age_display(start + Duration::minutes(5)), "5m ago");
        assert_eq!(entry.age_display(start + Duration::minutes(95)), "2h ago");
        assert_eq!(entry.age_display(start + Duration::hours(25)), "1d ago");
        // Clock skew
        assert_eq!(entry.age_display(start - Duration::minutes(3)), "just now");
    }
}

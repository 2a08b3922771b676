use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::item::{QueueId, QueueItem};
use crate::clock::Clock;
use crate::storage::{KeyValueStore, QUEUE_KEY};

/// Durable FIFO of pending mutations.
///
/// The whole queue is stored as one JSON array under `ccr_offline_queue`.
/// Every mutation is applied to a copy, persisted, and only then made
/// visible, so the in-memory view never runs ahead of what survives a
/// process kill. The lock is held across the persist, which keeps writes
/// from interleaving.
pub struct OfflineQueue {
    storage: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    items: Mutex<Vec<QueueItem>>,
}

impl OfflineQueue {
    /// Restore the queue from storage. Malformed items are dropped one by one
    /// so a single bad record cannot take the rest of the queue with it.
    pub async fn load(storage: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let items = match storage.get_item(QUEUE_KEY).await? {
            Some(contents) => parse_items(&contents),
            None => Vec::new(),
        };
        if !items.is_empty() {
            info!(pending = items.len(), "Restored offline queue");
        }
        Ok(Self {
            storage,
            clock,
            items: Mutex::new(items),
        })
    }

    pub async fn enqueue(&self, action: &str, payload: serde_json::Value) -> Result<QueueId> {
        let item = QueueItem::new(action, payload, self.clock.now());
        let id = item.id.clone();

        let mut items = self.items.lock().await;
        let mut next = items.clone();
        next.push(item);
        self.persist(&next).await?;
        *items = next;

        debug!(id = %id, action, pending = items.len(), "Queued offline mutation");
        Ok(id)
    }

    /// Re-insert an item captured elsewhere (e.g. an export from a previous
    /// install). Items whose id is already queued are ignored; returns whether
    /// the item was added.
    pub async fn restore(&self, item: QueueItem) -> Result<bool> {
        let mut items = self.items.lock().await;
        if items.iter().any(|existing| existing.id == item.id) {
            return Ok(false);
        }
        let mut next = items.clone();
        next.push(item);
        self.persist(&next).await?;
        *items = next;
        Ok(true)
    }

    /// Snapshot in enqueue order.
    pub async fn list(&self) -> Vec<QueueItem> {
        self.items.lock().await.clone()
    }

    pub async fn get(&self, id: &QueueId) -> Option<QueueItem> {
        self.items.lock().await.iter().find(|i| &i.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    pub async fn remove(&self, id: &QueueId) -> Result<Option<QueueItem>> {
        let mut items = self.items.lock().await;
        let Some(pos) = items.iter().position(|i| &i.id == id) else {
            return Ok(None);
        };
        let mut next = items.clone();
        let removed = next.remove(pos);
        self.persist(&next).await?;
        *items = next;
        Ok(Some(removed))
    }

    /// Count a replay attempt against `id` and persist it. Called before the
    /// request goes out, so an attempt cut short by a crash is still counted.
    /// Returns the updated item, or `None` if it is no longer queued.
    pub async fn mark_attempt(&self, id: &QueueId) -> Result<Option<QueueItem>> {
        let now = self.clock.now();
        self.update(id, |item| {
            item.retries = item.retries.saturating_add(1);
            item.last_attempt_at = Some(now);
        })
        .await
    }

    /// Remember why the latest attempt failed.
    pub async fn record_error(&self, id: &QueueId, error: &str) -> Result<Option<QueueItem>> {
        self.update(id, |item| item.last_error = Some(error.to_string()))
            .await
    }

    async fn update(
        &self,
        id: &QueueId,
        apply: impl FnOnce(&mut QueueItem),
    ) -> Result<Option<QueueItem>> {
        let mut items = self.items.lock().await;
        let Some(pos) = items.iter().position(|i| &i.id == id) else {
            return Ok(None);
        };
        let mut next = items.clone();
        apply(&mut next[pos]);
        let updated = next[pos].clone();
        self.persist(&next).await?;
        *items = next;
        Ok(Some(updated))
    }

    pub async fn clear(&self) -> Result<usize> {
        let mut items = self.items.lock().await;
        let count = items.len();
        self.persist(&[]).await?;
        items.clear();
        Ok(count)
    }

    async fn persist(&self, items: &[QueueItem]) -> Result<()> {
        let contents = serde_json::to_string(items).context("Failed to serialize offline queue")?;
        self.storage
            .set_item(QUEUE_KEY, &contents)
            .await
            .context("Failed to persist offline queue")
    }
}

fn parse_items(contents: &str) -> Vec<QueueItem> {
    let raw: Vec<serde_json::Value> = match serde_json::from_str(contents) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "Persisted offline queue is unreadable, starting empty");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(raw.len());
    for (index, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<QueueItem>(value) {
            Ok(item) if seen.insert(item.id.clone()) => items.push(item),
            Ok(item) => warn!(id = %item.id, "Dropping duplicate queue item"),
            Err(e) => warn!(index, error = %e, "Dropping malformed queue item"),
        }
    }
    items
}

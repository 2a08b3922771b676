//! Wiring for the offline core.
//!
//! `OfflineContext` is built once per process and shared by `Arc`. It owns
//! the cache, the queue, the sync engine and the connectivity observer, and
//! hands out `OfflineClient`s for application code.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::stream::BoxStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::config::OfflineConfig;
use crate::connectivity::{ConnectivityObserver, SyncTrigger, Unsubscribe};
use crate::operation::OfflineClient;
use crate::queue::OfflineQueue;
use crate::storage::KeyValueStore;
use crate::sync::{SyncEngine, SyncReason, SyncStatus};

pub struct OfflineContext {
    config: OfflineConfig,
    cache: Arc<CacheStore>,
    queue: Arc<OfflineQueue>,
    engine: Arc<SyncEngine>,
    connectivity: Arc<ConnectivityObserver>,
    client: OfflineClient,

    worker: Mutex<Option<JoinHandle<()>>>,
    signal: Mutex<Option<Unsubscribe>>,
}

impl OfflineContext {
    /// Load persisted state and wire the components together. Nothing runs in
    /// the background until `start`.
    pub async fn build(
        config: OfflineConfig,
        storage: Arc<dyn KeyValueStore>,
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(CacheStore::new(
            Arc::clone(&storage),
            Arc::clone(&clock),
            config.default_ttl(),
        ));
        let queue = Arc::new(OfflineQueue::load(Arc::clone(&storage), Arc::clone(&clock)).await?);
        let engine = Arc::new(
            SyncEngine::load(
                Arc::clone(&queue),
                storage,
                Arc::clone(&backend),
                clock,
                config.clone(),
            )
            .await?,
        );

        let trigger: Arc<dyn SyncTrigger> = engine.clone();
        let connectivity = Arc::new(ConnectivityObserver::new(config.debounce(), Some(trigger)));

        // The observer holds the engine, so the engine only gets a weak view back
        let observer = Arc::downgrade(&connectivity);
        engine.set_online_probe(Arc::new(move || {
            observer.upgrade().map(|o| o.status()).unwrap_or(true)
        }));

        let client = OfflineClient::new(
            Arc::clone(&cache),
            Arc::clone(&queue),
            Arc::clone(&connectivity),
            backend,
            Arc::clone(&engine),
        );

        info!(pending = queue.len().await, "Offline core ready");
        Ok(Arc::new(Self {
            config,
            cache,
            queue,
            engine,
            connectivity,
            client,
            worker: Mutex::new(None),
            signal: Mutex::new(None),
        }))
    }

    /// Start the sync worker, attach the connectivity signal and request an
    /// initial drain for anything left over from a previous session.
    pub fn start(&self, signal: Option<BoxStream<'static, bool>>) {
        if let Some(worker) = self.engine.spawn_worker() {
            *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);
        } else {
            debug!("Sync worker already running");
        }

        let unsubscribe = self.connectivity.init(signal);
        let previous = self
            .signal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(unsubscribe);
        if let Some(previous) = previous {
            previous.unsubscribe();
        }

        self.engine.trigger(SyncReason::Manual);
    }

    /// The host app came to the foreground.
    pub fn on_foreground(&self) {
        self.engine.trigger(SyncReason::Foreground);
    }

    /// Detach from the signal and stop background work. Persisted state is
    /// left as is; a pass interrupted here resumes on the next start.
    pub fn shutdown(&self) {
        if let Some(signal) = self.signal.lock().unwrap_or_else(|e| e.into_inner()).take() {
            signal.unsubscribe();
        }
        self.engine.cancel_retry();
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            worker.abort();
        }
        info!("Offline core stopped");
    }

    pub fn client(&self) -> OfflineClient {
        self.client.clone()
    }

    pub async fn status(&self) -> SyncStatus {
        self.client.status().await
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityObserver> {
        &self.connectivity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RemoteError;
    use crate::clock::ManualClock;
    use crate::operation::Outcome;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    #[derive(Default)]
    struct ServerBackend {
        received: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Backend for ServerBackend {
        async fn replay(&self, action: &str, payload: &Value) -> Result<Value, RemoteError> {
            self.received
                .lock()
                .unwrap()
                .push((action.to_string(), payload.clone()));
            Ok(json!({"ok": true}))
        }
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn context(storage: Arc<MemoryStore>, backend: Arc<ServerBackend>) -> Arc<OfflineContext> {
        let config = OfflineConfig {
            debounce_ms: 0,
            ..Default::default()
        };
        OfflineContext::build(config, storage, backend, Arc::new(ManualClock::at_epoch()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_offline_write_replayed_on_reconnect() {
        let backend = Arc::new(ServerBackend::default());
        let ctx = context(Arc::new(MemoryStore::new()), backend.clone()).await;
        ctx.start(None);

        ctx.connectivity().report(false);
        let out = ctx
            .client()
            .perform("createDonation", json!({"amount": 1000, "type": "tithe"}))
            .await
            .unwrap();
        assert!(out.is_queued());
        assert_eq!(ctx.status().await.pending, 1);
        let before = ctx.engine().last_sync_at();

        ctx.connectivity().report(true);
        wait_for(|| {
            let ctx = ctx.clone();
            async move { ctx.queue().is_empty().await }
        })
        .await;

        let received = backend.received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "createDonation");
        assert_eq!(received[0].1["amount"], 1000);
        assert!(ctx.engine().last_sync_at().is_some());
        assert!(ctx.engine().last_sync_at() >= before);

        ctx.shutdown();
    }

    #[tokio::test]
    async fn test_leftover_queue_drained_on_start() {
        let storage = Arc::new(MemoryStore::new());
        let backend = Arc::new(ServerBackend::default());

        let first = context(storage.clone(), backend.clone()).await;
        first.connectivity().report(false);
        let queued = first.client().perform("logPrayer", json!({"minutes": 10})).await.unwrap();
        assert!(matches!(queued, Outcome::Queued(_)));
        drop(first);

        // New session over the same storage
        let second = context(storage, backend.clone()).await;
        assert_eq!(second.queue().len().await, 1);
        second.start(None);
        wait_for(|| {
            let ctx = second.clone();
            async move { ctx.queue().is_empty().await }
        })
        .await;
        assert_eq!(backend.received.lock().unwrap().len(), 1);

        second.shutdown();
    }

    #[tokio::test]
    async fn test_engine_skips_pass_while_observer_offline() {
        let backend = Arc::new(ServerBackend::default());
        let ctx = context(Arc::new(MemoryStore::new()), backend.clone()).await;
        ctx.connectivity().report(false);
        ctx.client().perform("joinDepartment", json!({"id": 4})).await.unwrap();

        let outcome = ctx.engine().sync().await.unwrap();
        assert_eq!(outcome, crate::sync::SyncOutcome::Offline);
        assert!(backend.received.lock().unwrap().is_empty());
    }
}

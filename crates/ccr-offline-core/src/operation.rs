//! Offline-aware operation wrapper.
//!
//! The one entry point application code uses for remote reads and writes.
//! Reads go to the network first and fall back to the cache; writes go to the
//! network first and fall back to the offline queue. Only failures the
//! backend classifies as transient take the fallback path. A request the
//! server has already rejected is never queued.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{Backend, ErrorClass, RemoteError};
use crate::cache::CacheStore;
use crate::connectivity::ConnectivityObserver;
use crate::queue::{OfflineQueue, QueueId};
use crate::sync::{SyncEngine, SyncStatus};

#[derive(Error, Debug)]
pub enum OfflineError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Local storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// What the caller intends to do.
#[derive(Debug, Clone)]
pub enum Operation {
    Read {
        cache_key: String,
        /// Falls back to the cache's default TTL.
        ttl: Option<Duration>,
    },
    Write {
        action: String,
        payload: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// Fresh result from the backend.
    Live(T),
    /// The network failed; this is the last cached value.
    StaleFallback { data: T, written_at: DateTime<Utc> },
    /// The write could not be sent and will be replayed by the sync engine.
    Queued(QueueId),
}

impl<T> Outcome<T> {
    pub fn data(&self) -> Option<&T> {
        match self {
            Outcome::Live(data) | Outcome::StaleFallback { data, .. } => Some(data),
            Outcome::Queued(_) => None,
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            Outcome::Live(data) | Outcome::StaleFallback { data, .. } => Some(data),
            Outcome::Queued(_) => None,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Outcome::Queued(_))
    }
}

/// Handle application code holds. Clone is cheap.
#[derive(Clone)]
pub struct OfflineClient {
    cache: Arc<CacheStore>,
    queue: Arc<OfflineQueue>,
    connectivity: Arc<ConnectivityObserver>,
    backend: Arc<dyn Backend>,
    engine: Arc<SyncEngine>,
}

impl OfflineClient {
    pub fn new(
        cache: Arc<CacheStore>,
        queue: Arc<OfflineQueue>,
        connectivity: Arc<ConnectivityObserver>,
        backend: Arc<dyn Backend>,
        engine: Arc<SyncEngine>,
    ) -> Self {
        Self {
            cache,
            queue,
            connectivity,
            backend,
            engine,
        }
    }

    pub async fn execute<T, F, Fut>(
        &self,
        operation: Operation,
        remote_call: F,
    ) -> Result<Outcome<T>, OfflineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        match operation {
            Operation::Read { cache_key, ttl } => self.read(&cache_key, ttl, remote_call).await,
            Operation::Write { action, payload } => self.write(&action, payload, remote_call).await,
        }
    }

    /// Typed read.
    pub async fn fetch<T, F, Fut>(
        &self,
        cache_key: &str,
        ttl: Option<Duration>,
        remote_call: F,
    ) -> Result<Outcome<T>, OfflineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.read(cache_key, ttl, remote_call).await
    }

    /// Typed write with a caller-supplied remote call. `payload` is what the
    /// sync engine will replay through the backend if the call cannot be made.
    pub async fn submit<T, P, F, Fut>(
        &self,
        action: &str,
        payload: &P,
        remote_call: F,
    ) -> Result<Outcome<T>, OfflineError>
    where
        T: Serialize + DeserializeOwned,
        P: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let payload = serde_json::to_value(payload).map_err(anyhow::Error::from)?;
        self.write(action, payload, remote_call).await
    }

    /// Write through the backend directly: the same call a later replay makes.
    pub async fn perform(&self, action: &str, payload: Value) -> Result<Outcome<Value>, OfflineError> {
        let backend = Arc::clone(&self.backend);
        let replay_payload = payload.clone();
        self.write(action, payload, || async move {
            backend.replay(action, &replay_payload).await
        })
        .await
    }

    pub async fn status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.connectivity.status(),
            is_syncing: self.engine.is_syncing(),
            pending: self.queue.len().await,
            last_sync_at: self.engine.last_sync_at(),
        }
    }

    async fn read<T, F, Fut>(
        &self,
        cache_key: &str,
        ttl: Option<Duration>,
        remote_call: F,
    ) -> Result<Outcome<T>, OfflineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let error = if self.connectivity.status() {
            match remote_call().await {
                Ok(data) => {
                    let ttl = ttl.unwrap_or_else(|| self.cache.default_ttl());
                    if let Err(e) = self.cache.put(cache_key, &data, ttl).await {
                        warn!(key = cache_key, error = %e, "Failed to cache fresh value");
                    }
                    return Ok(Outcome::Live(data));
                }
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e.into()),
            }
        } else {
            RemoteError::Offline
        };

        match self.cache.get_entry::<T>(cache_key).await? {
            Some(entry) => {
                debug!(key = cache_key, error = %error, "Serving cached value");
                Ok(Outcome::StaleFallback {
                    data: entry.data,
                    written_at: entry.written_at,
                })
            }
            None => Err(error.into()),
        }
    }

    async fn write<T, F, Fut>(
        &self,
        action: &str,
        payload: Value,
        remote_call: F,
    ) -> Result<Outcome<T>, OfflineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let error = if self.connectivity.status() {
            match remote_call().await {
                Ok(data) => return Ok(Outcome::Live(data)),
                Err(e) if self.backend.classify(action, &e) == ErrorClass::Transient => e,
                Err(e) => return Err(e.into()),
            }
        } else {
            RemoteError::Offline
        };

        let id = self.queue.enqueue(action, payload).await?;
        info!(id = %id, action, error = %error, "Write queued for sync");
        Ok(Outcome::Queued(id))
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{QuarantineReason, SyncOutcome, SyncReason, SyncReport, TerminalFailure};
use crate::backend::{Backend, ErrorClass};
use crate::clock::Clock;
use crate::config::{OfflineConfig, OrderingPolicy};
use crate::connectivity::SyncTrigger;
use crate::queue::{OfflineQueue, QueueItem};
use crate::storage::{KeyValueStore, LAST_SYNC_KEY};

/// Buffer size for the terminal-failure broadcast channel.
/// Slow subscribers miss old failures rather than stalling a drain.
const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// Returns the last known connectivity status.
pub type OnlineProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Holds the drain flag for the duration of one pass. Dropping it (pass
/// finished, errored, or the future was cancelled) releases the flag.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Replays the offline queue against the backend.
///
/// At most one drain pass runs at a time: the `is_syncing` flag is taken with
/// a compare-and-swap, and a call that loses the race returns
/// `SyncOutcome::AlreadySyncing` without touching the queue.
///
/// Items are processed strictly in queue order. Each attempt is counted and
/// persisted before the request goes out, so a pass killed mid-replay still
/// uses up one attempt. A success removes the item; a permanent failure
/// quarantines it immediately; a transient failure leaves it for a later
/// pass. An item is attempted at most `max_retries + 1` times before it is
/// quarantined.
pub struct SyncEngine {
    queue: Arc<OfflineQueue>,
    storage: Arc<dyn KeyValueStore>,
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    config: OfflineConfig,

    is_syncing: AtomicBool,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    online_probe: OnceLock<OnlineProbe>,

    failures: broadcast::Sender<TerminalFailure>,
    requests_tx: mpsc::UnboundedSender<SyncReason>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncReason>>>,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub async fn load(
        queue: Arc<OfflineQueue>,
        storage: Arc<dyn KeyValueStore>,
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
        config: OfflineConfig,
    ) -> Result<Self> {
        let last_sync_at = match storage.get_item(LAST_SYNC_KEY).await? {
            Some(raw) => match DateTime::parse_from_rfc3339(raw.trim()) {
                Ok(at) => Some(at.with_timezone(&Utc)),
                Err(e) => {
                    warn!(value = %raw, error = %e, "Ignoring malformed last-sync marker");
                    None
                }
            },
            None => None,
        };

        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        Ok(Self {
            queue,
            storage,
            backend,
            clock,
            config,
            is_syncing: AtomicBool::new(false),
            last_sync_at: Mutex::new(last_sync_at),
            online_probe: OnceLock::new(),
            failures,
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            retry_timer: Mutex::new(None),
        })
    }

    /// Gate passes on connectivity. Without a probe the engine assumes online.
    pub fn set_online_probe(&self, probe: OnlineProbe) {
        if self.online_probe.set(probe).is_err() {
            warn!("Online probe already set, ignoring");
        }
    }

    fn is_online(&self) -> bool {
        self.online_probe.get().map(|probe| probe()).unwrap_or(true)
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::Acquire)
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receive every item the engine gives up on.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<TerminalFailure> {
        self.failures.subscribe()
    }

    /// Run one drain pass now.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        self.drain(SyncReason::Manual).await
    }

    /// Ask the background worker for a pass. Never blocks.
    pub fn trigger(&self, reason: SyncReason) {
        if self.requests_tx.send(reason).is_err() {
            debug!(?reason, "Sync worker stopped, dropping request");
        }
    }

    /// Start the single consumer of sync requests. Requests already waiting
    /// when a pass starts are folded into it; one arriving mid-pass gets
    /// exactly one follow-up pass.
    /// Returns `None` if the worker was already started.
    pub fn spawn_worker(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self
            .requests_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        let engine = Arc::clone(self);

        Some(tokio::spawn(async move {
            while let Some(reason) = rx.recv().await {
                while rx.try_recv().is_ok() {}
                if let Err(e) = engine.drain(reason).await {
                    error!(error = %e, "Sync pass aborted");
                }
            }
            debug!("Sync worker exiting");
        }))
    }

    /// Cancel a pending automatic retry.
    pub fn cancel_retry(&self) {
        if let Some(timer) = self.retry_timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            timer.abort();
        }
    }

    async fn drain(&self, reason: SyncReason) -> Result<SyncOutcome> {
        if !self.is_online() {
            debug!(?reason, "Offline, skipping sync pass");
            return Ok(SyncOutcome::Offline);
        }
        let Some(_guard) = DrainGuard::acquire(&self.is_syncing) else {
            debug!(?reason, "Sync already in progress");
            return Ok(SyncOutcome::AlreadySyncing);
        };

        let snapshot = self.queue.list().await;
        info!(?reason, pending = snapshot.len(), "Sync pass started");

        let mut report = SyncReport::default();
        let mut soonest_retry: Option<u32> = None;

        for queued in snapshot {
            // Re-read: an earlier item's outcome or a concurrent remove may have changed it
            let Some(current) = self.queue.get(&queued.id).await else {
                continue;
            };
            if current.retries > self.config.max_retries {
                // Every allowed attempt was started but the pass never saw the result
                let error = current
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "attempt interrupted".to_string());
                self.quarantine(current, QuarantineReason::RetriesExhausted, error)
                    .await?;
                report.quarantined += 1;
                continue;
            }

            let Some(item) = self.queue.mark_attempt(&current.id).await? else {
                continue;
            };
            report.attempted += 1;

            match self.backend.replay(&item.action, &item.payload).await {
                Ok(_) => {
                    self.queue.remove(&item.id).await?;
                    report.succeeded += 1;
                    debug!(id = %item.id, action = %item.action, "Replayed queued mutation");
                }
                Err(error) => match self.backend.classify(&item.action, &error) {
                    ErrorClass::Permanent => {
                        self.quarantine(item, QuarantineReason::Rejected, error.to_string())
                            .await?;
                        report.quarantined += 1;
                    }
                    ErrorClass::Transient if item.retries > self.config.max_retries => {
                        self.quarantine(item, QuarantineReason::RetriesExhausted, error.to_string())
                            .await?;
                        report.quarantined += 1;
                    }
                    ErrorClass::Transient => {
                        self.queue.record_error(&item.id, &error.to_string()).await?;
                        let retries = item.retries;
                        report.deferred += 1;
                        soonest_retry = Some(soonest_retry.map_or(retries, |r| r.min(retries)));
                        warn!(
                            id = %item.id,
                            action = %item.action,
                            retries,
                            error = %error,
                            "Replay failed, deferring"
                        );
                        if self.config.ordering == OrderingPolicy::Strict {
                            report.halted = true;
                            break;
                        }
                    }
                },
            }

            tokio::task::yield_now().await;
        }

        report.remaining = self.queue.len().await;
        if report.succeeded > 0 || report.remaining == 0 {
            self.record_sync().await?;
        }
        if let Some(retries) = soonest_retry {
            self.schedule_retry(self.config.backoff_delay(retries));
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            deferred = report.deferred,
            quarantined = report.quarantined,
            remaining = report.remaining,
            "Sync pass finished"
        );
        Ok(SyncOutcome::Completed(report))
    }

    async fn quarantine(
        &self,
        item: QueueItem,
        reason: QuarantineReason,
        error: String,
    ) -> Result<()> {
        self.queue.remove(&item.id).await?;
        warn!(
            id = %item.id,
            action = %item.action,
            retries = item.retries,
            ?reason,
            error = %error,
            "Queue item quarantined"
        );
        // No receivers is fine: the log above is the record of last resort
        let _ = self.failures.send(TerminalFailure {
            item,
            reason,
            error,
            failed_at: self.clock.now(),
        });
        Ok(())
    }

    async fn record_sync(&self) -> Result<()> {
        let now = self.clock.now();
        self.storage
            .set_item(LAST_SYNC_KEY, &now.to_rfc3339())
            .await?;
        *self.last_sync_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
        Ok(())
    }

    fn schedule_retry(&self, delay: Duration) {
        let tx = self.requests_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SyncReason::Backoff);
        });
        debug!(delay_ms = delay.as_millis() as u64, "Scheduled sync retry");

        let previous = self
            .retry_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl SyncTrigger for SyncEngine {
    fn trigger_sync(&self) {
        self.trigger(SyncReason::Reconnect);
    }
}

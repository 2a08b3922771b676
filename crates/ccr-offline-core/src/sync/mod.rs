//! Sync engine: drains the offline queue against the backend.
//!
//! Passes are requested from three places: an explicit `sync()`, the
//! connectivity observer on reconnect, and the host's app-foreground event.
//! A background worker consumes those requests one at a time and also runs
//! the delayed retries the engine schedules after transient failures.
//!
//! `last_sync_at` moves when a pass replays at least one item or ends with
//! an empty queue.

pub mod engine;

pub use engine::{OnlineProbe, SyncEngine};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::QueueItem;

/// Why a pass was requested. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    Manual,
    Reconnect,
    Foreground,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub enum QuarantineReason {
    /// The backend rejected the request outright.
    Rejected,
    /// Transient failures used up the retry budget.
    RetriesExhausted,
}

/// An item the engine gave up on. Hosts surface these as deferred
/// notifications ("your donation could not be recorded").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct TerminalFailure {
    pub item: QueueItem,
    pub reason: QuarantineReason,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Counters for one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub deferred: usize,
    pub quarantined: usize,
    /// Items still queued when the pass ended.
    pub remaining: usize,
    /// The pass stopped at a deferred item (strict ordering).
    pub halted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass held the drain flag; nothing was processed.
    AlreadySyncing,
    /// Connectivity is down; nothing was attempted.
    Offline,
}

/// Snapshot for status indicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
}

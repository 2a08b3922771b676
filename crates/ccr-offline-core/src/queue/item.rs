use std::fmt;
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::{Generator, Ulid};

/// Shared so ids created in the same millisecond still sort in creation order.
fn generator() -> &'static Mutex<Generator> {
    static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();
    GENERATOR.get_or_init(|| Mutex::new(Generator::new()))
}

/// Identifier of a queued mutation: a ULID in its 26-character text form.
///
/// Ids are monotonic within a process, and the 80 random bits keep ids from
/// separate installs distinct.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(transparent)]
pub struct QueueId(String);

impl QueueId {
    pub fn generate(now: DateTime<Utc>) -> Self {
        let at = SystemTime::from(now);
        let ulid = generator()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .generate_from_datetime(at)
            // Random part exhausted within one millisecond
            .unwrap_or_else(|_| Ulid::from_datetime(at));
        Self(ulid.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creation time encoded in the id, if it is a well-formed ULID.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let ulid = Ulid::from_string(&self.0).ok()?;
        DateTime::from_timestamp_millis(ulid.timestamp_ms() as i64)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A mutation captured while the backend was unreachable, waiting to be
/// replayed by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: QueueId,
    /// Backend operation to replay, e.g. `createDonation`.
    pub action: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay attempts so far.
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(action: impl Into<String>, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: QueueId::generate(now),
            action: action.into(),
            payload,
            enqueued_at: now,
            retries: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }
}

//! Durable queue of mutations captured while the backend was unreachable.
//!
//! Replay order is strict FIFO across all actions: several business actions
//! depend on each other (a profile update must land before a donation that
//! references it), so the queue never reorders by action type.

pub mod item;
pub mod offline;

pub use item::{QueueId, QueueItem};
pub use offline::OfflineQueue;

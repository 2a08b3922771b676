//! Remote backend seam.
//!
//! The core never speaks a wire protocol itself. Queued mutations are
//! replayed through a `Backend`, which maps an action tag plus payload onto
//! whatever request the real API expects and reports failures as a
//! `RemoteError`.
//!
//! Whether a given failure is worth retrying depends on the action (a 409 can
//! mean "try again later" for one resource and "already exists" for another),
//! so classification is part of the trait rather than a fixed table.

pub mod error;
pub mod http;

pub use error::{ErrorClass, RemoteError};
pub use http::HttpBackend;

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Perform `action` with `payload`, returning the backend's response body.
    async fn replay(&self, action: &str, payload: &Value) -> Result<Value, RemoteError>;

    /// Classify a failure of `action`. Defaults to the generic mapping.
    fn classify(&self, _action: &str, error: &RemoteError) -> ErrorClass {
        error.class()
    }
}

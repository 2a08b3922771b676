use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of a failed backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("No network connection")]
    Offline,

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error ({status}): {body}")]
    ServerError { status: u16, body: String },

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rejected by server ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// How the sync engine and the operation wrapper treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Connectivity, timeouts, 5xx, 429: worth retrying later.
    Transient,
    /// The backend looked at the request and said no. Never retried.
    Permanent,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RemoteError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            401 => RemoteError::Unauthorized,
            403 => RemoteError::AccessDenied(truncated),
            404 => RemoteError::NotFound(truncated),
            408 => RemoteError::Timeout,
            429 => RemoteError::RateLimited,
            500..=599 => RemoteError::ServerError {
                status,
                body: truncated,
            },
            400..=499 => RemoteError::Rejected {
                status,
                body: truncated,
            },
            _ => RemoteError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Timeout => Some(408),
            RemoteError::RateLimited => Some(429),
            RemoteError::Unauthorized => Some(401),
            RemoteError::AccessDenied(_) => Some(403),
            RemoteError::NotFound(_) => Some(404),
            RemoteError::ServerError { status, .. } | RemoteError::Rejected { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Generic classification. Backends refine this per action through
    /// `Backend::classify`.
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Offline
            | RemoteError::Timeout
            | RemoteError::Network(_)
            | RemoteError::RateLimited
            | RemoteError::ServerError { .. } => ErrorClass::Transient,
            RemoteError::Unauthorized
            | RemoteError::AccessDenied(_)
            | RemoteError::NotFound(_)
            | RemoteError::Rejected { .. }
            | RemoteError::InvalidResponse(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else if e.is_connect() {
            RemoteError::Offline
        } else if let Some(status) = e.status() {
            RemoteError::from_status(status.as_u16(), &e.to_string())
        } else if e.is_decode() {
            RemoteError::InvalidResponse(e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

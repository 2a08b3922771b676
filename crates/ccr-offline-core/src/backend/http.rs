//! HTTP implementation of the `Backend` seam.
//!
//! Every action is a `POST {base}/actions/{action}` with the queued payload
//! as the JSON body; reads are plain `GET {base}/{path}`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::debug;

use super::{Backend, ErrorClass, RemoteError};

/// HTTP request timeout in seconds.
/// Timeouts are classified transient, so a slow network defers rather than fails.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Backend client for the CCR REST API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
    /// Per-action statuses that should be retried rather than rejected.
    transient_statuses: HashMap<String, HashSet<u16>>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            transient_statuses: HashMap::new(),
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Treat `status` as transient for `action` (e.g. a 409 that the server
    /// uses to signal a lock held by another writer).
    pub fn with_transient_status(mut self, action: &str, status: u16) -> Self {
        self.transient_statuses
            .entry(action.to_string())
            .or_default()
            .insert(status);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, RemoteError> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| RemoteError::InvalidResponse(format!("Invalid token: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status.as_u16(), &body))
        }
    }

    /// Body of a successful response. The request already took effect, so a
    /// body that is not JSON is passed through as a string, never an error.
    async fn read_body(response: reqwest::Response) -> Result<Value, RemoteError> {
        let text = response.text().await?;
        Ok(parse_body(text))
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/actions/{}", self.base_url, urlencoding::encode(action))
    }

    /// GET a resource for the read path of the operation wrapper.
    pub async fn fetch(&self, path: &str) -> Result<Value, RemoteError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await?;
        Self::read_body(Self::check_response(response).await?).await
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn replay(&self, action: &str, payload: &Value) -> Result<Value, RemoteError> {
        let url = self.action_url(action);
        debug!(url = %url, action, "POST");
        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers()?)
            .json(payload)
            .send()
            .await?;
        Self::read_body(Self::check_response(response).await?).await
    }

    fn classify(&self, action: &str, error: &RemoteError) -> ErrorClass {
        let overridden = error
            .status()
            .zip(self.transient_statuses.get(action))
            .is_some_and(|(status, statuses)| statuses.contains(&status));
        if overridden {
            ErrorClass::Transient
        } else {
            error.class()
        }
    }
}

fn parse_body(text: String) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Success body is not JSON, keeping it as text");
            Value::String(text)
        }
    }
}

//! Transport abstraction.
//!
//! A [`Transport`] performs exactly one HTTP exchange. It knows nothing about
//! credentials or refresh; the session layer decorates requests before they
//! get here and classifies failures after they come back.

mod http;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use http::HttpTransport;
pub use reqwest::Method;

use crate::error::SessionError;
use crate::models::Credential;

/// Description of a request, sufficient to issue it again.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the configured base URL.
    pub path: String,
    /// Header names are stored lowercase.
    headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
    /// Overrides the transport's default timeout.
    pub timeout: Option<Duration>,
    retried: bool,
    sent_with: Option<Credential>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
            retried: false,
            sent_with: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Insert or replace a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(&name.to_ascii_lowercase());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether this request already went through one refresh-and-replay.
    #[inline]
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    /// Credential attached on the most recent attempt.
    pub fn sent_with(&self) -> Option<&Credential> {
        self.sent_with.as_ref()
    }

    pub(crate) fn set_sent_with(&mut self, credential: Option<Credential>) {
        self.sent_with = credential;
    }
}

/// Successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed JSON body. Non-JSON bodies are kept as a JSON string, empty bodies as `null`.
    pub body: serde_json::Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    /// Decode the body into a typed value.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SessionError> {
        Ok(T::deserialize(&self.body)?)
    }
}

/// Failure of a single exchange.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The absolute per-request timeout elapsed.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// No response was received.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status}")]
    Status {
        status: u16,
        body: serde_json::Value,
    },
}

/// Performs a single HTTP exchange.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Decode a response body: JSON when possible, otherwise the raw text.
pub(crate) fn decode_body(bytes: &[u8]) -> serde_json::Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(bytes).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
    })
}

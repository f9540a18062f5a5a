//! Outbound side of the proxy.
//!
//! Every proxied route funnels through a single [`Forwarder`], parameterised
//! per route by a [`RetryPolicy`].  Handlers never talk to `reqwest`
//! directly.

pub mod forwarder;
pub mod retry;

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;

pub use forwarder::Forwarder;
pub use retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A single logical call against the upstream API.  Re-sent verbatim on
/// every attempt.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path relative to the upstream API root, e.g. `/areas/compare`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    /// Serialized JSON body, if any.
    pub body: Option<Bytes>,
}

impl UpstreamRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn post_json(path: impl Into<String>, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(path)
        }
    }

    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// The final upstream response after retries.
#[derive(Debug)]
pub struct Forwarded {
    pub status: StatusCode,
    pub body: Bytes,
    /// Attempts made, including the one that produced this response.
    pub attempts: u32,
    /// Backoff delays slept between attempts, in order.
    pub backoffs: Vec<Duration>,
    /// The attempt cap was reached and the last response still carried a
    /// retryable status.
    pub retries_exhausted: bool,
}

/// Every attempt failed without producing a response.  Carries the failure
/// of the final attempt.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream did not respond within {timeout:?} (after {attempts} attempts)")]
    Timeout { attempts: u32, timeout: Duration },
    #[error("upstream request failed after {attempts} attempts: {message}")]
    Network { attempts: u32, message: String },
}

#[cfg(test)]
impl ForwardError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Timeout { attempts, .. } | Self::Network { attempts, .. } => *attempts,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

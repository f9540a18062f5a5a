//! Retrying HTTP forwarder.
//!
//! Issues one [`UpstreamRequest`] against the configured API root, retrying
//! transport failures and retryable statuses with exponential backoff.
//! Attempts are strictly sequential: attempt N+1 never starts before attempt
//! N has resolved or hit its deadline.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::{ForwardError, Forwarded, RetryPolicy, UpstreamRequest};

/// Failure of a single attempt, before retry classification.
#[derive(Debug)]
enum AttemptError {
    Timeout,
    Network(String),
}

/// Shared outbound client bound to one upstream API root.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    api_root: String,
}

impl Forwarder {
    pub fn new(client: reqwest::Client, api_root: impl Into<String>) -> Self {
        Self {
            client,
            api_root: api_root.into().trim_end_matches('/').to_string(),
        }
    }

    /// Absolute upstream URL for `path`, without the query string.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.api_root, path.trim_start_matches('/'))
    }

    /// Send `req` under `policy`.
    ///
    /// Returns the last response received, retryable or not, once no further
    /// attempt is warranted.  Returns [`ForwardError`] only when the final
    /// attempt produced no response at all.
    #[instrument(skip_all, fields(method = %req.method, path = %req.path))]
    pub async fn forward(
        &self,
        req: &UpstreamRequest,
        policy: &RetryPolicy,
    ) -> Result<Forwarded, ForwardError> {
        let url = self.url_for(&req.path);
        let mut backoffs = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            let attempts = attempt + 1;
            let last = attempts >= policy.max_attempts();

            match self.attempt(&url, req, policy.timeout()).await {
                Ok((status, body)) => {
                    let retryable = policy.is_retryable_status(status.as_u16());
                    if !retryable || last {
                        debug!(%status, attempts, "upstream responded");
                        return Ok(Forwarded {
                            status,
                            body,
                            attempts,
                            backoffs,
                            retries_exhausted: retryable,
                        });
                    }
                    warn!(%status, attempt = attempts, "retryable upstream status");
                }
                Err(AttemptError::Timeout) if last => {
                    return Err(ForwardError::Timeout {
                        attempts,
                        timeout: policy.timeout(),
                    });
                }
                Err(AttemptError::Network(message)) if last => {
                    return Err(ForwardError::Network { attempts, message });
                }
                Err(e) => {
                    warn!(error = ?e, attempt = attempts, "upstream attempt failed");
                }
            }

            let delay = policy.backoff(attempt);
            debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
            tokio::time::sleep(delay).await;
            backoffs.push(delay);
            attempt += 1;
        }
    }

    /// One attempt, bounded by `timeout` end to end (connect, headers and
    /// body).  The deadline timer is dropped together with the future.
    async fn attempt(
        &self,
        url: &str,
        req: &UpstreamRequest,
        timeout: Duration,
    ) -> Result<(StatusCode, Bytes), AttemptError> {
        let mut builder = self
            .client
            .request(req.method.clone(), url)
            .headers(req.headers.clone());
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(body) = &req.body {
            builder = builder
                .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(body.clone());
        }

        let send = async {
            let resp = builder.send().await?;
            let status = resp.status();
            let body = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        match tokio::time::timeout(timeout, send).await {
            Ok(Ok(parts)) => Ok(parts),
            Ok(Err(e)) if e.is_timeout() => Err(AttemptError::Timeout),
            Ok(Err(e)) => Err(AttemptError::Network(e.to_string())),
            Err(_elapsed) => Err(AttemptError::Timeout),
        }
    }
}

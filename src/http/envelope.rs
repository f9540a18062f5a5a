//! Per-request envelope: correlation id, latency, structured access/error
//! logging and the uniform JSON error body.

use std::time::Instant;

use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::cache_control::CachePolicy;
use super::validate::Invalid;
use crate::metrics::{Metrics, Outcome};
use crate::route::Route;
use crate::upstream::{ForwardError, Forwarded};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_RESPONSE_TIME: HeaderName = HeaderName::from_static("x-response-time");

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Every way a proxied call can end other than success.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    Validation(#[from] Invalid),
    #[error("Upstream returned {}", .status.as_u16())]
    Upstream { status: StatusCode, details: String },
    #[error("Upstream unavailable after {attempts} attempts")]
    RetriesExhausted { attempts: u32, details: String },
    #[error("Request timeout")]
    Timeout { attempts: u32 },
    #[error("Network error")]
    Network { attempts: u32, message: String },
    #[error("Invalid response format from API")]
    Parse,
}

impl From<ForwardError> for ProxyError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::Timeout { attempts, .. } => Self::Timeout { attempts },
            ForwardError::Network { attempts, message } => Self::Network { attempts, message },
        }
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { status, .. } => *status,
            Self::RetriesExhausted { .. } | Self::Network { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Parse => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classification written to the error log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Upstream { .. } | Self::RetriesExhausted { .. } => "upstream",
            Self::Timeout { .. } => "timeout",
            Self::Network { .. } => "network",
            Self::Parse => "parse",
        }
    }

    fn outcome(&self) -> Outcome {
        match self {
            Self::Validation(_) => Outcome::Rejected,
            Self::Upstream { .. } => Outcome::UpstreamError,
            Self::RetriesExhausted { .. } => Outcome::RetriesExhausted,
            Self::Timeout { .. } => Outcome::Timeout,
            Self::Network { .. } => Outcome::NetworkError,
            Self::Parse => Outcome::ParseError,
        }
    }

    fn attempts(&self) -> u32 {
        match self {
            Self::Validation(_) | Self::Upstream { .. } | Self::Parse => 0,
            Self::RetriesExhausted { attempts, .. }
            | Self::Timeout { attempts }
            | Self::Network { attempts, .. } => *attempts,
        }
    }

    fn details(&self) -> Option<&str> {
        match self {
            Self::Upstream { details, .. } | Self::RetriesExhausted { details, .. } => {
                Some(details.as_str())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
    #[serde(rename = "requestId")]
    request_id: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retries_exhausted: bool,
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// Lives for exactly one inbound request.
#[derive(Debug)]
pub struct RequestContext {
    request_id: String,
    route: Route,
    started: Instant,
    params: Value,
}

impl RequestContext {
    pub fn new(route: Route) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            route,
            started: Instant::now(),
            params: Value::Null,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn route(&self) -> Route {
        self.route
    }

    /// Request parameters worth keeping in the access log.
    pub fn set_params(&mut self, params: Value) {
        self.params = params;
    }

    pub fn request_id_header(&self) -> HeaderValue {
        // A hyphenated UUID is always a valid header value.
        HeaderValue::from_str(&self.request_id).unwrap_or(HeaderValue::from_static("invalid"))
    }

    fn latency_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Turn the final upstream response into the client response.
    ///
    /// 2xx JSON is passed through byte-for-byte; anything else becomes an
    /// error envelope.
    pub fn respond(self, metrics: &Metrics, upstream_url: &str, fwd: Forwarded) -> Response {
        self.log_access(upstream_url, fwd.status, fwd.attempts);

        if fwd.retries_exhausted {
            let err = ProxyError::RetriesExhausted {
                attempts: fwd.attempts,
                details: String::from_utf8_lossy(&fwd.body).into_owned(),
            };
            return self.fail(metrics, err);
        }

        if !fwd.status.is_success() {
            let err = ProxyError::Upstream {
                status: fwd.status,
                details: String::from_utf8_lossy(&fwd.body).into_owned(),
            };
            return self.finish_error(metrics, err, fwd.attempts);
        }

        if serde_json::from_slice::<serde::de::IgnoredAny>(&fwd.body).is_err() {
            return self.finish_error_logged(metrics, ProxyError::Parse, fwd.attempts);
        }

        metrics.observe_request(
            self.route,
            Outcome::Success,
            self.started.elapsed().as_secs_f64(),
            fwd.attempts,
        );

        let mut resp = (
            fwd.status,
            [(header::CONTENT_TYPE, "application/json")],
            fwd.body,
        )
            .into_response();
        if let Some(policy) = CachePolicy::for_route(self.route) {
            if let Ok(value) = HeaderValue::from_str(&policy.header_value()) {
                resp.headers_mut().insert(header::CACHE_CONTROL, value);
            }
        }
        self.stamp(resp)
    }

    /// Terminal failure without an upstream response (or a rejected
    /// request).  Logged, counted and rendered.
    pub fn fail(self, metrics: &Metrics, err: ProxyError) -> Response {
        let attempts = err.attempts();
        self.finish_error_logged(metrics, err, attempts)
    }

    fn finish_error_logged(self, metrics: &Metrics, err: ProxyError, attempts: u32) -> Response {
        self.log_error(&err);
        self.finish_error(metrics, err, attempts)
    }

    fn finish_error(self, metrics: &Metrics, err: ProxyError, attempts: u32) -> Response {
        metrics.observe_request(
            self.route,
            err.outcome(),
            self.started.elapsed().as_secs_f64(),
            attempts,
        );
        let body = ErrorBody {
            error: err.to_string(),
            details: err.details(),
            request_id: &self.request_id,
            retries_exhausted: matches!(err, ProxyError::RetriesExhausted { .. }),
        };
        let resp = (err.status(), Json(body)).into_response();
        self.stamp(resp)
    }

    /// Attach the correlation id and elapsed milliseconds.
    fn stamp(&self, mut resp: Response) -> Response {
        let headers = resp.headers_mut();
        headers.insert(X_REQUEST_ID, self.request_id_header());
        headers.insert(X_RESPONSE_TIME, HeaderValue::from(self.latency_ms()));
        resp
    }

    fn log_access(&self, upstream_url: &str, status: StatusCode, attempts: u32) {
        info!(
            target: "access",
            request_id = %self.request_id,
            route = self.route.endpoint(),
            upstream = upstream_url,
            status = status.as_u16(),
            latency_ms = self.latency_ms(),
            attempts,
            timestamp = %chrono::Utc::now().to_rfc3339(),
            params = %self.params,
            "proxied request"
        );
    }

    fn log_error(&self, err: &ProxyError) {
        let latency_ms = self.latency_ms();
        let timestamp = chrono::Utc::now().to_rfc3339();
        let cause = match err {
            ProxyError::Network { message, .. } => message.as_str(),
            _ => "",
        };
        if let ProxyError::Validation(_) = err {
            warn!(
                target: "proxy_error",
                request_id = %self.request_id,
                route = self.route.endpoint(),
                error = %err,
                kind = err.kind(),
                latency_ms,
                %timestamp,
                "rejected request"
            );
        } else {
            error!(
                target: "proxy_error",
                request_id = %self.request_id,
                route = self.route.endpoint(),
                error = %err,
                cause,
                kind = err.kind(),
                latency_ms,
                %timestamp,
                "proxy request failed"
            );
        }
    }
}

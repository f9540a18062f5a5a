use std::time::{Duration, Instant};

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::http::cache_control::NO_STORE;
use crate::metrics::{HealthLabels, MetricsRegistry};
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: String,
    #[serde(rename = "upstreamUrl")]
    pub upstream_url: String,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub root: CheckResult,
    pub areas: CheckResult,
    pub wellbeing: CheckResult,
}

/// `Unhealthy` means the upstream answered with a non-2xx status, `Error`
/// that it did not answer at all (refused, reset, timed out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
    Error,
}

impl CheckStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    #[serde(rename = "latency")]
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(latency_ms: u64) -> Self {
        Self {
            status: CheckStatus::Healthy,
            latency_ms,
            detail: None,
        }
    }

    fn unhealthy(latency_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Unhealthy,
            latency_ms,
            detail: Some(detail.into()),
        }
    }

    fn error(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Error,
            latency_ms: 0,
            detail: Some(detail.into()),
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == CheckStatus::Healthy
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of `AppState` required by the upstream health check.
#[derive(Clone)]
pub struct HealthState {
    pub http_client: reqwest::Client,
    pub base_url: String,
    pub api_root: String,
    pub timeout: Duration,
    pub metrics: MetricsRegistry,
}

impl From<&AppState> for HealthState {
    fn from(state: &AppState) -> Self {
        Self {
            http_client: state.http_client.clone(),
            base_url: state.config.upstream.base_url.trim_end_matches('/').to_string(),
            api_root: state.config.upstream.api_root(),
            timeout: Duration::from_secs(state.config.health.timeout_secs),
            metrics: state.metrics.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// One `GET` against the upstream, bounded by `timeout`.  Never retried.
async fn probe(client: &reqwest::Client, url: &str, timeout: Duration) -> CheckResult {
    let started = Instant::now();
    match tokio::time::timeout(timeout, client.get(url).send()).await {
        Ok(Ok(resp)) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            if resp.status().is_success() {
                CheckResult::healthy(latency_ms)
            } else {
                CheckResult::unhealthy(latency_ms, format!("GET {url} returned {}", resp.status()))
            }
        }
        Ok(Err(e)) => CheckResult::error(format!("GET {url} failed: {e}")),
        Err(_) => CheckResult::error(format!("GET {url} timed out after {timeout:?}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if checks.root.is_healthy() && checks.areas.is_healthy() && checks.wellbeing.is_healthy() {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    }
}

fn record(metrics: &MetricsRegistry, checks: &HealthChecks) {
    for (name, check) in [
        ("root", &checks.root),
        ("areas", &checks.areas),
        ("wellbeing", &checks.wellbeing),
    ] {
        metrics
            .metrics
            .health_checks_total
            .get_or_create(&HealthLabels {
                check: name.to_string(),
                status: check.status.as_str().to_string(),
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// `GET /api/health/upstream`.  Returns 200 only when all three probes are
/// healthy, 503 otherwise.
pub async fn upstream_health(state: &HealthState) -> Response {
    let areas_url = format!("{}/areas/?skip=0&limit=1", state.api_root);
    let presets_url = format!("{}/wellbeing/weights/presets", state.api_root);
    let root_url = format!("{}/", state.base_url);

    let (root, areas, wellbeing) = tokio::join!(
        probe(&state.http_client, &root_url, state.timeout),
        probe(&state.http_client, &areas_url, state.timeout),
        probe(&state.http_client, &presets_url, state.timeout),
    );

    let checks = HealthChecks {
        root,
        areas,
        wellbeing,
    };
    record(&state.metrics, &checks);
    let status = aggregate_status(&checks);

    if status == HealthStatus::Unhealthy {
        tracing::warn!(
            root = checks.root.status.as_str(),
            areas = checks.areas.status.as_str(),
            wellbeing = checks.wellbeing.status.as_str(),
            "upstream health check failed"
        );
    }

    let body = HealthResponse {
        status,
        timestamp: chrono::Utc::now().to_rfc3339(),
        upstream_url: state.base_url.clone(),
        checks,
    };
    let http_status = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, [(header::CACHE_CONTROL, NO_STORE)], Json(body)).into_response()
}

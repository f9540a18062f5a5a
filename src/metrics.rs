use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::route::Route;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub route: String,
    pub outcome: Outcome,
}

/// Terminal state of one proxied call.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Rejected,
    UpstreamError,
    RetriesExhausted,
    Timeout,
    NetworkError,
    ParseError,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub route: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthLabels {
    pub check: String,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub requests_total: Family<RequestLabels, Counter>,
    pub request_duration_seconds: Family<RouteLabels, Histogram>,
    pub upstream_attempts_total: Family<RouteLabels, Counter>,
    pub upstream_retries_total: Family<RouteLabels, Counter>,
    pub health_checks_total: Family<HealthLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "wellbeing_proxy_requests",
            "Proxied requests by route and terminal outcome",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<RouteLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            });
        registry.register(
            "wellbeing_proxy_request_duration_seconds",
            "End-to-end proxy latency in seconds, retries included",
            request_duration_seconds.clone(),
        );

        let upstream_attempts_total = Family::<RouteLabels, Counter>::default();
        registry.register(
            "wellbeing_proxy_upstream_attempts",
            "Outbound attempts against the upstream API",
            upstream_attempts_total.clone(),
        );

        let upstream_retries_total = Family::<RouteLabels, Counter>::default();
        registry.register(
            "wellbeing_proxy_upstream_retries",
            "Outbound attempts beyond the first",
            upstream_retries_total.clone(),
        );

        let health_checks_total = Family::<HealthLabels, Counter>::default();
        registry.register(
            "wellbeing_proxy_health_checks",
            "Upstream health probes by check and result",
            health_checks_total.clone(),
        );

        Self {
            requests_total,
            request_duration_seconds,
            upstream_attempts_total,
            upstream_retries_total,
            health_checks_total,
        }
    }

    /// Record the terminal state of one proxied call.
    pub fn observe_request(&self, route: Route, outcome: Outcome, elapsed_secs: f64, attempts: u32) {
        let route = route.as_str().to_string();
        self.requests_total
            .get_or_create(&RequestLabels {
                route: route.clone(),
                outcome,
            })
            .inc();
        let labels = RouteLabels { route };
        self.request_duration_seconds
            .get_or_create(&labels)
            .observe(elapsed_secs);
        if attempts > 0 {
            self.upstream_attempts_total
                .get_or_create(&labels)
                .inc_by(u64::from(attempts));
            self.upstream_retries_total
                .get_or_create(&labels)
                .inc_by(u64::from(attempts - 1));
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

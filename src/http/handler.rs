//! Main axum router and proxy route handlers.
//!
//! Routes:
//! - `GET     /api/proxy/areas?skip&limit`                 - Area listing
//! - `GET     /api/proxy/areas/{area_id}`                  - Area detail
//! - `POST    /api/proxy/areas/compare`                    - Side-by-side comparison
//! - `GET     /api/proxy/areas/{area_id}/congestion`       - Congestion summary
//! - `GET     /api/proxy/areas/{area_id}/live-congestion`  - Live congestion
//! - `POST    /api/proxy/search`                           - Area search
//! - `POST    /api/proxy/simulation/household`             - Household simulation
//! - `POST    /api/proxy/wellbeing/ranking`                - Weighted ranking
//! - `OPTIONS /api/proxy/wellbeing/ranking`                - CORS preflight
//! - `GET     /api/proxy/wellbeing/weights/presets`        - Weight presets
//! - `GET     /api/health/upstream`                        - Composite upstream health
//! - `GET     /metrics`                                    - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, error, instrument};

use super::envelope::{RequestContext, X_REQUEST_ID};
use super::validate::{self, AreasQuery, Invalid};
use crate::health::{self, HealthState};
use crate::route::Route;
use crate::upstream::UpstreamRequest;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Area resources
        .route("/api/proxy/areas", get(handle_areas))
        .route("/api/proxy/areas/compare", post(handle_compare))
        .route("/api/proxy/areas/{area_id}", get(handle_area_detail))
        .route(
            "/api/proxy/areas/{area_id}/congestion",
            get(handle_congestion),
        )
        .route(
            "/api/proxy/areas/{area_id}/live-congestion",
            get(handle_live_congestion),
        )
        // Search, simulation, wellbeing
        .route("/api/proxy/search", post(handle_search))
        .route("/api/proxy/simulation/household", post(handle_simulation))
        .route(
            "/api/proxy/wellbeing/ranking",
            post(handle_ranking).options(handle_ranking_preflight),
        )
        .route(
            "/api/proxy/wellbeing/weights/presets",
            get(handle_weight_presets),
        )
        // Health, metrics
        .route("/api/health/upstream", get(handle_upstream_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /api/proxy/areas?skip=&limit=`
#[instrument(skip_all)]
async fn handle_areas(
    State(state): State<Arc<AppState>>,
    query: Result<Query<AreasQuery>, QueryRejection>,
) -> Response {
    let mut ctx = RequestContext::new(Route::Areas);
    let page = match query
        .map_err(|_| Invalid("Invalid query string"))
        .and_then(|Query(q)| validate::pagination(&q))
    {
        Ok(page) => page,
        Err(e) => return ctx.fail(&state.metrics.metrics, e.into()),
    };
    ctx.set_params(json!({ "skip": page.skip, "limit": page.limit }));

    let req = UpstreamRequest::get("/areas/")
        .with_query("skip", page.skip)
        .with_query("limit", page.limit);
    proxy(&state, ctx, req).await
}

/// `GET /api/proxy/areas/{area_id}`
#[instrument(skip(state))]
async fn handle_area_detail(
    State(state): State<Arc<AppState>>,
    Path(area_id): Path<String>,
) -> Response {
    proxy_area(&state, Route::AreaDetail, &area_id, |id| format!("/areas/{id}")).await
}

/// `GET /api/proxy/areas/{area_id}/congestion`
#[instrument(skip(state))]
async fn handle_congestion(
    State(state): State<Arc<AppState>>,
    Path(area_id): Path<String>,
) -> Response {
    proxy_area(&state, Route::Congestion, &area_id, |id| {
        format!("/congestion/area/{id}/")
    })
    .await
}

/// `GET /api/proxy/areas/{area_id}/live-congestion`
#[instrument(skip(state))]
async fn handle_live_congestion(
    State(state): State<Arc<AppState>>,
    Path(area_id): Path<String>,
) -> Response {
    proxy_area(&state, Route::LiveCongestion, &area_id, |id| {
        format!("/congestion-google/area/{id}/live")
    })
    .await
}

/// `POST /api/proxy/areas/compare`
///
/// Rejects a missing or empty `area_ids` array without contacting upstream.
#[instrument(skip_all)]
async fn handle_compare(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let mut ctx = RequestContext::new(Route::Compare);
    let area_ids = match validate::json_object(&body)
        .and_then(|v| validate::compare_body(&v).map(|ids| Value::from(ids.to_vec())))
    {
        Ok(ids) => ids,
        Err(e) => return ctx.fail(&state.metrics.metrics, e.into()),
    };
    ctx.set_params(json!({ "area_ids": area_ids }));

    proxy(&state, ctx, UpstreamRequest::post_json("/areas/compare", body)).await
}

/// `POST /api/proxy/search`
#[instrument(skip_all)]
async fn handle_search(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let mut ctx = RequestContext::new(Route::Search);
    let parsed = match validate::json_object(&body) {
        Ok(v) => v,
        Err(e) => return ctx.fail(&state.metrics.metrics, e.into()),
    };
    ctx.set_params(json!({
        "max_rent": parsed.get("max_rent"),
        "min_rent": parsed.get("min_rent"),
        "room_type": parsed.get("room_type"),
        "area_names": parsed.get("area_names"),
    }));

    proxy(&state, ctx, UpstreamRequest::post_json("/search/", body)).await
}

/// `POST /api/proxy/simulation/household`
#[instrument(skip_all)]
async fn handle_simulation(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let ctx = RequestContext::new(Route::Simulation);
    if let Err(e) = validate::json_object(&body) {
        return ctx.fail(&state.metrics.metrics, e.into());
    }

    proxy(
        &state,
        ctx,
        UpstreamRequest::post_json("/simulation/household/", body),
    )
    .await
}

/// `POST /api/proxy/wellbeing/ranking`
#[instrument(skip_all)]
async fn handle_ranking(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let ctx = RequestContext::new(Route::WellbeingRanking);
    if let Err(e) = validate::json_object(&body).and_then(|v| validate::ranking_body(&v)) {
        return ctx.fail(&state.metrics.metrics, e.into());
    }

    proxy(
        &state,
        ctx,
        UpstreamRequest::post_json("/wellbeing/ranking", body),
    )
    .await
}

/// `OPTIONS /api/proxy/wellbeing/ranking`
async fn handle_ranking_preflight() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
        ],
    )
}

/// `GET /api/proxy/wellbeing/weights/presets`
#[instrument(skip_all)]
async fn handle_weight_presets(State(state): State<Arc<AppState>>) -> Response {
    let ctx = RequestContext::new(Route::WeightPresets);
    proxy(
        &state,
        ctx,
        UpstreamRequest::get("/wellbeing/weights/presets"),
    )
    .await
}

/// `GET /api/health/upstream`
async fn handle_upstream_health(State(state): State<Arc<AppState>>) -> Response {
    let health_state = HealthState::from(state.as_ref());
    health::upstream_health(&health_state).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(buf) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Validate an area id path segment and proxy a `GET` to the upstream path
/// built from it.
async fn proxy_area(
    state: &AppState,
    route: Route,
    raw_id: &str,
    upstream_path: impl FnOnce(&str) -> String,
) -> Response {
    let mut ctx = RequestContext::new(route);
    let area_id = match validate::area_id(raw_id) {
        Ok(id) => id,
        Err(e) => return ctx.fail(&state.metrics.metrics, e.into()),
    };
    ctx.set_params(json!({ "area_id": area_id }));

    proxy(state, ctx, UpstreamRequest::get(upstream_path(area_id))).await
}

/// Forward `req` under the route's retry policy and shape the result.
async fn proxy(state: &AppState, ctx: RequestContext, req: UpstreamRequest) -> Response {
    let req = req.with_header(X_REQUEST_ID, ctx.request_id_header());
    let policy = state.config.retry_policy(ctx.route());
    let upstream_url = state.forwarder.url_for(&req.path);
    debug!(
        request_id = ctx.request_id(),
        upstream = %upstream_url,
        max_attempts = policy.max_attempts(),
        "forwarding request"
    );

    match state.forwarder.forward(&req, &policy).await {
        Ok(fwd) => ctx.respond(&state.metrics.metrics, &upstream_url, fwd),
        Err(e) => ctx.fail(&state.metrics.metrics, e.into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::http::envelope::X_RESPONSE_TIME;
    use crate::test_support::{refused_base_url, StubUpstream};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(base_url: String) -> Arc<AppState> {
        let mut config = Config::default();
        config.upstream.base_url = base_url;
        config.retry.base_delay_ms = 10;
        config.retry.timeout_secs = 1;
        config.route_overrides.clear();
        Arc::new(AppState::new(config).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(state: &Arc<AppState>, req: Request<Body>) -> Response {
        create_router(Arc::clone(state)).oneshot(req).await.unwrap()
    }

    async fn body_bytes(resp: Response) -> Bytes {
        resp.into_body().collect().await.unwrap().to_bytes()
    }

    async fn body_json(resp: Response) -> Value {
        serde_json::from_slice(&body_bytes(resp).await).unwrap()
    }

    // ── Validation ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn areas_rejects_bad_pagination_without_upstream_call() {
        let stub = StubUpstream::echo().await;
        let state = test_state(stub.base_url());

        for uri in [
            "/api/proxy/areas?skip=-1",
            "/api/proxy/areas?skip=abc",
            "/api/proxy/areas?limit=0",
            "/api/proxy/areas?limit=101",
            "/api/proxy/areas?skip=-1&limit=200",
        ] {
            let resp = send(&state, get(uri)).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
            let id = resp.headers()[X_REQUEST_ID].to_str().unwrap().to_string();
            let body = body_json(resp).await;
            assert!(body["error"].as_str().unwrap().starts_with("Invalid"));
            assert_eq!(body["requestId"], id.as_str());
        }
        assert_eq!(stub.hits(), 0);
    }

    #[tokio::test]
    async fn compare_requires_area_ids() {
        let stub = StubUpstream::echo().await;
        let state = test_state(stub.base_url());

        for body in ["{}", r#"{"area_ids": []}"#, r#"{"area_ids": "x"}"#, "not json"] {
            let resp = send(&state, post("/api/proxy/areas/compare", body)).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{body}");
        }
        assert_eq!(stub.hits(), 0);
    }

    #[tokio::test]
    async fn ranking_requires_weights() {
        let stub = StubUpstream::echo().await;
        let state = test_state(stub.base_url());

        let resp = send(&state, post("/api/proxy/wellbeing/ranking", r#"{"limit": 5}"#)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await["error"],
            "Invalid request: weights required"
        );
        assert_eq!(stub.hits(), 0);
    }

    #[tokio::test]
    async fn bad_area_id_rejected() {
        let stub = StubUpstream::echo().await;
        let state = test_state(stub.base_url());

        let resp = send(&state, get("/api/proxy/areas/bad.id/congestion")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "Invalid area id");
        assert_eq!(stub.hits(), 0);
    }

    // ── Forwarding ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn areas_forwards_pagination_and_sets_headers() {
        let stub = StubUpstream::echo().await;
        let state = test_state(stub.base_url());

        let resp = send(&state, get("/api/proxy/areas?skip=0&limit=10")).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let id = resp.headers()[X_REQUEST_ID].to_str().unwrap().to_string();
        assert!(!id.is_empty());
        assert!(!resp.headers()[X_RESPONSE_TIME].is_empty());
        assert_eq!(
            resp.headers()[header::CACHE_CONTROL],
            "public, s-maxage=300, stale-while-revalidate=600"
        );

        let echoed = body_json(resp).await;
        assert_eq!(echoed["method"], "GET");
        assert_eq!(echoed["path"], "/api/v1/areas/");
        assert_eq!(echoed["query"], "skip=0&limit=10");
        assert_eq!(echoed["request_id"], id.as_str());
    }

    #[tokio::test]
    async fn success_body_is_forwarded_verbatim() {
        let raw = r#"{ "results" : [ {"_id":"a1","rent": 120000.0} ], "total":1 }"#;
        let stub = StubUpstream::scripted(vec![(200, raw)]).await;
        let state = test_state(stub.base_url());

        let resp = send(&state, post("/api/proxy/search", r#"{"max_rent": 200000}"#)).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(header::CACHE_CONTROL).is_none());
        assert_eq!(body_bytes(resp).await.as_ref(), raw.as_bytes());
    }

    #[tokio::test]
    async fn compare_forwards_body() {
        let stub = StubUpstream::echo().await;
        let state = test_state(stub.base_url());
        let payload = r#"{"area_ids":["a1","a2"]}"#;

        let resp = send(&state, post("/api/proxy/areas/compare", payload)).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let echoed = body_json(resp).await;
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["path"], "/api/v1/areas/compare");
        assert_eq!(echoed["body"], payload);
        assert_eq!(echoed["content_type"], "application/json");
    }

    #[tokio::test]
    async fn area_routes_map_to_upstream_paths() {
        let stub = StubUpstream::echo().await;
        let state = test_state(stub.base_url());

        let cases = [
            ("/api/proxy/areas/a1", "/api/v1/areas/a1", "public, s-maxage=60, stale-while-revalidate=300"),
            (
                "/api/proxy/areas/a1/congestion",
                "/api/v1/congestion/area/a1/",
                "public, s-maxage=300, stale-while-revalidate=600",
            ),
            (
                "/api/proxy/areas/a1/live-congestion",
                "/api/v1/congestion-google/area/a1/live",
                "public, s-maxage=60, stale-while-revalidate=300",
            ),
            (
                "/api/proxy/wellbeing/weights/presets",
                "/api/v1/wellbeing/weights/presets",
                "public, s-maxage=300, stale-while-revalidate=600",
            ),
        ];
        for (local, upstream, cache) in cases {
            let resp = send(&state, get(local)).await;
            assert_eq!(resp.status(), StatusCode::OK, "{local}");
            assert_eq!(resp.headers()[header::CACHE_CONTROL], cache, "{local}");
            assert_eq!(body_json(resp).await["path"], upstream, "{local}");
        }
    }

    #[tokio::test]
    async fn post_routes_map_to_upstream_paths() {
        let stub = StubUpstream::echo().await;
        let state = test_state(stub.base_url());

        let cases = [
            ("/api/proxy/search", "/api/v1/search/", "{}"),
            (
                "/api/proxy/simulation/household",
                "/api/v1/simulation/household/",
                r#"{"family_size": 3}"#,
            ),
            (
                "/api/proxy/wellbeing/ranking",
                "/api/v1/wellbeing/ranking",
                r#"{"weights": {"safety": 0.5}}"#,
            ),
        ];
        for (local, upstream, payload) in cases {
            let resp = send(&state, post(local, payload)).await;
            assert_eq!(resp.status(), StatusCode::OK, "{local}");
            assert_eq!(body_json(resp).await["path"], upstream, "{local}");
        }
    }

    #[tokio::test]
    async fn ranking_preflight() {
        let state = test_state(refused_base_url().await);
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/api/proxy/wellbeing/ranking")
            .body(Body::empty())
            .unwrap();

        let resp = send(&state, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
            "POST, OPTIONS"
        );
    }

    // ── Failure handling ────────────────────────────────────────────────

    #[tokio::test]
    async fn transient_503_retried_to_success() {
        let stub =
            StubUpstream::scripted(vec![(503, "{}"), (503, "{}"), (200, r#"[{"_id":"a1"}]"#)]).await;
        let state = test_state(stub.base_url());

        let resp = send(&state, get("/api/proxy/areas")).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await.as_ref(), br#"[{"_id":"a1"}]"#);
        assert_eq!(stub.hits(), 3);
    }

    #[tokio::test]
    async fn persistent_502_surfaces_as_exhausted() {
        let stub = StubUpstream::scripted(vec![(502, "gateway")]).await;
        let state = test_state(stub.base_url());

        let resp = send(&state, get("/api/proxy/wellbeing/weights/presets")).await;

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.headers().get(header::CACHE_CONTROL).is_none());
        let body = body_json(resp).await;
        assert_eq!(body["retries_exhausted"], true);
        assert_eq!(body["details"], "gateway");
        assert_eq!(stub.hits(), 3);
    }

    #[tokio::test]
    async fn upstream_404_passed_through_in_envelope() {
        let stub = StubUpstream::scripted(vec![(404, r#"{"detail":"Area not found"}"#)]).await;
        let state = test_state(stub.base_url());

        let resp = send(&state, get("/api/proxy/areas/missing")).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let id = resp.headers()[X_REQUEST_ID].to_str().unwrap().to_string();
        let body = body_json(resp).await;
        assert_eq!(body["error"], "Upstream returned 404");
        assert_eq!(body["details"], r#"{"detail":"Area not found"}"#);
        assert_eq!(body["requestId"], id.as_str());
        assert_eq!(stub.hits(), 1);
    }

    #[tokio::test]
    async fn slow_upstream_yields_504() {
        let stub = StubUpstream::slow(Duration::from_secs(3)).await;
        let mut config = Config::default();
        config.upstream.base_url = stub.base_url();
        config.retry.base_delay_ms = 10;
        config.retry.timeout_secs = 1;
        config.retry.max_attempts = 2;
        let state = Arc::new(AppState::new(config).unwrap());

        let resp = send(&state, get("/api/proxy/areas")).await;

        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(resp.headers().get(X_REQUEST_ID).is_some());
        assert_eq!(body_json(resp).await["error"], "Request timeout");
        assert_eq!(stub.hits(), 2);
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_503() {
        let state = test_state(refused_base_url().await);

        let resp = send(&state, post("/api/proxy/search", "{}")).await;

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "Network error");
        assert!(body["requestId"].is_string());
    }

    #[tokio::test]
    async fn non_json_upstream_yields_500() {
        let stub = StubUpstream::scripted(vec![(200, "<html>oops</html>")]).await;
        let state = test_state(stub.base_url());

        let resp = send(&state, post("/api/proxy/simulation/household", "{}")).await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(resp).await["error"],
            "Invalid response format from API"
        );
    }

    // ── Metrics ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn metrics_reflect_outcomes() {
        let stub = StubUpstream::scripted(vec![(200, "[]")]).await;
        let state = test_state(stub.base_url());

        send(&state, get("/api/proxy/areas")).await;
        send(&state, get("/api/proxy/areas?limit=0")).await;

        let resp = send(&state, get("/metrics")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(resp).await.to_vec()).unwrap();
        assert!(text.contains(r#"wellbeing_proxy_requests_total{route="areas",outcome="Success"} 1"#));
        assert!(text.contains(r#"wellbeing_proxy_requests_total{route="areas",outcome="Rejected"} 1"#));
    }
}

//! In-process stand-in for the upstream API, bound to an ephemeral port.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{Json, Router};
use tokio::task::JoinHandle;

pub struct StubUpstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl StubUpstream {
    /// Serve an arbitrary router, counting every request it receives.
    pub async fn serve(router: Router) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = router.layer(axum::middleware::map_request(move |req: Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { req }
        }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { addr, hits, handle }
    }

    /// Answer every request with the next `(status, json body)` pair; the
    /// last pair repeats once the script runs out.
    pub async fn scripted(script: Vec<(u16, &'static str)>) -> Self {
        assert!(!script.is_empty());
        let script = Arc::new(script);
        let cursor = Arc::new(AtomicUsize::new(0));
        let router = Router::new().fallback(move || {
            let script = Arc::clone(&script);
            let cursor = Arc::clone(&cursor);
            async move {
                let i = cursor.fetch_add(1, Ordering::SeqCst).min(script.len() - 1);
                let (status, body) = script[i];
                (
                    StatusCode::from_u16(status).unwrap(),
                    [(header::CONTENT_TYPE, "application/json")],
                    body,
                )
                    .into_response()
            }
        });
        Self::serve(router).await
    }

    /// Sleep `delay` before answering anything.
    pub async fn slow(delay: Duration) -> Self {
        let router = Router::new().fallback(move || async move {
            tokio::time::sleep(delay).await;
            (StatusCode::OK, "{}").into_response()
        });
        Self::serve(router).await
    }

    /// Reflect the received request back as JSON.
    pub async fn echo() -> Self {
        let router = Router::new().fallback(|req: Request| async move {
            let (parts, body) = req.into_parts();
            let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
            let header = |name: &str| {
                parts
                    .headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            };
            Json(serde_json::json!({
                "method": parts.method.as_str(),
                "path": parts.uri.path(),
                "query": parts.uri.query(),
                "request_id": header("x-request-id"),
                "content_type": header("content-type"),
                "body": String::from_utf8_lossy(&body),
            }))
        });
        Self::serve(router).await
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for StubUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A base URL on which nothing is listening.
pub async fn refused_base_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

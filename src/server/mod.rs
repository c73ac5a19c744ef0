//! HTTP endpoints.
//!
//! - `GET /healthz` answers `ok.` for liveness probes
//! - `GET /metrics` serves the Prometheus registry
//!
//! Every request runs in a span carrying the method, path and the W3C
//! `traceparent` header when the caller sent one.

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::Request;
use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};

use crate::metrics::metrics_handler;

/// Body returned by the health check.
pub const HEALTH_BODY: &str = "ok.";

async fn health_handler() -> &'static str {
    HEALTH_BODY
}

/// Builds the router.
pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            let traceparent = request
                .headers()
                .get("traceparent")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();

            info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                traceparent = %traceparent,
            )
        }))
}

/// Serves the router on `port` until the shutdown signal fires.
///
/// # Errors
///
/// Returns an error if the port cannot be bound or the server fails.
pub async fn serve(port: u16, mut shutdown_rx: broadcast::Receiver<()>) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(port, "Starting HTTP server");

    axum::serve(listener, router())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
}

//! HTTP exposition endpoint.
//!
//! `/metrics` renders the registry on every request and never waits for a
//! collector. The health probes report the process, not collector state.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
};
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

use crate::metrics::MetricRegistry;

/// Content type of the Prometheus text exposition format.
pub const TEXT_FORMAT: &str = prometheus::TEXT_FORMAT;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<MetricRegistry>,
}

/// Create the Axum router with all routes.
pub fn create_router(registry: Arc<MetricRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
        .with_state(AppState { registry })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], state.registry.render())
}

/// Liveness probe.
async fn healthz_handler() -> &'static str {
    "Ok"
}

/// Readiness probe. Ready as soon as the server accepts connections.
async fn readyz_handler() -> &'static str {
    "Ok"
}

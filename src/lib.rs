//! Contextual product placement engine
//!
//! Takes a source video and a product image, finds a plausible insertion
//! zone in the scene, matches the product to the scene lighting, composites
//! it into the frames around the chosen moment and scores the result. Jobs
//! run asynchronously on an in-process worker pool behind a small HTTP API.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use app_state::AppState;

/// Build the API router.
pub fn build_router(
    state: AppState,
    prometheus: Arc<PrometheusHandle>,
    max_body_bytes: usize,
) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/media", post(routes::media::upload_media))
        .route("/api/v1/jobs", post(routes::jobs::create_job))
        .route("/api/v1/jobs/{job_id}", get(routes::jobs::get_job_status))
        .route(
            "/api/v1/jobs/{job_id}/result",
            get(routes::jobs::get_job_result),
        )
        .route(
            "/api/v1/jobs/{job_id}/cancel",
            post(routes::jobs::cancel_job),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
}

//! HTTP API for the resumable upload protocol

mod errors;
pub mod handlers;

pub use errors::UploadError;

use crate::metrics::{http_metrics_middleware, metrics_handler};
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use handlers::{health_check, probe_chunk, upload_chunk, AppState};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the application router.
///
///   GET  /upload/{project}/{container}?resumable... - probe a chunk
///   POST /upload/{project}/{container}?resumable... - upload a chunk
///   GET  /health
///   GET  /metrics
pub fn router(state: Arc<AppState>, max_chunk_size: usize) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route(
            "/upload/:project/:container",
            get(probe_chunk).post(upload_chunk),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            http_metrics_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        // Chunk bodies plus multipart framing; axum's 2 MB default is too small
        .layer(DefaultBodyLimit::max(max_chunk_size))
        .with_state(state)
}

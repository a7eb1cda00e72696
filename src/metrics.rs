//! Prometheus metrics for the upload proxy.
//!
//! All metric types use atomics internally (no locks on the hot path).
//! The `Metrics` struct is `Clone`-cheap (Arc-based registry + Arc-based collectors).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder, TEXT_FORMAT,
};
use std::sync::Arc;
use std::time::Instant;

use crate::api::handlers::AppState;
use crate::types::{ChunkOutcome, UploadMode};

/// All Prometheus metrics for the upload proxy.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // -- Process & Build --
    pub process_start_time_seconds: Gauge,
    pub build_info: GaugeVec,

    // -- HTTP Requests --
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,

    // -- Uploads --
    pub upload_chunks_total: IntCounterVec,
    pub upload_bytes_total: IntCounterVec,
    pub upload_manifest_writes_total: IntCounterVec,
    pub upload_active_sessions: IntGauge,

    // -- Backend --
    pub backend_duration_seconds: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // -- Process & Build --
        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry
            .register(Box::new(process_start_time_seconds.clone()))
            .unwrap();

        let build_info = GaugeVec::new(
            Opts::new("upload_proxy_build_info", "Build information"),
            &["version", "backend_type"],
        )
        .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();

        // Register standard process metrics (RSS, CPU, open FDs on Linux)
        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        // -- HTTP Requests --
        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "upload_proxy_http_requests_total",
                "Total HTTP requests by method, status, and operation",
            ),
            &["method", "status", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_requests_total.clone()))
            .unwrap();

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "upload_proxy_http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .unwrap();

        // -- Uploads --
        let upload_chunks_total = IntCounterVec::new(
            Opts::new(
                "upload_chunks_total",
                "Chunk requests by upload mode and outcome",
            ),
            &["mode", "outcome"],
        )
        .unwrap();
        registry
            .register(Box::new(upload_chunks_total.clone()))
            .unwrap();

        let upload_bytes_total = IntCounterVec::new(
            Opts::new(
                "upload_bytes_total",
                "Chunk bytes accepted by upload mode",
            ),
            &["mode"],
        )
        .unwrap();
        registry
            .register(Box::new(upload_bytes_total.clone()))
            .unwrap();

        let upload_manifest_writes_total = IntCounterVec::new(
            Opts::new(
                "upload_manifest_writes_total",
                "Manifest writes by result",
            ),
            &["result"],
        )
        .unwrap();
        registry
            .register(Box::new(upload_manifest_writes_total.clone()))
            .unwrap();

        let upload_active_sessions = IntGauge::new(
            "upload_active_sessions",
            "Upload sessions currently held in memory",
        )
        .unwrap();
        registry
            .register(Box::new(upload_active_sessions.clone()))
            .unwrap();

        // -- Backend --
        let backend_duration_buckets = vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ];
        let backend_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "upload_backend_duration_seconds",
                "Backend request duration in seconds",
            )
            .buckets(backend_duration_buckets),
            &["op"],
        )
        .unwrap();
        registry
            .register(Box::new(backend_duration_seconds.clone()))
            .unwrap();

        Metrics {
            registry,
            process_start_time_seconds,
            build_info,
            http_requests_total,
            http_request_duration_seconds,
            upload_chunks_total,
            upload_bytes_total,
            upload_manifest_writes_total,
            upload_active_sessions,
            backend_duration_seconds,
        }
    }

    pub fn observe_backend(&self, op: &str, started: Instant) {
        self.backend_duration_seconds
            .with_label_values(&[op])
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn record_manifest(&self, ok: bool) {
        self.upload_manifest_writes_total
            .with_label_values(&[if ok { "ok" } else { "failed" }])
            .inc();
    }

    pub fn record_chunk(&self, mode: UploadMode, outcome: &str, bytes: Option<u64>) {
        self.upload_chunks_total
            .with_label_values(&[mode.label(), outcome])
            .inc();
        if let Some(bytes) = bytes {
            self.upload_bytes_total
                .with_label_values(&[mode.label()])
                .inc_by(bytes);
        }
    }
}

/// Bounded label for a chunk request result.
pub fn outcome_label(result: &Result<ChunkOutcome, crate::api::UploadError>) -> &'static str {
    match result {
        Ok(ChunkOutcome::Stored) => "stored",
        Ok(ChunkOutcome::AlreadyPresent) => "present",
        Err(e) => e.code(),
    }
}

/// Classify a request into a bounded operation label.
pub fn classify_operation(method: &str, path: &str) -> &'static str {
    match path {
        "/health" => return "health",
        "/metrics" => return "metrics",
        _ => {}
    }

    let is_upload = path.starts_with("/upload/");
    match (method, is_upload) {
        ("GET", true) => "probe_chunk",
        ("POST", true) => "upload_chunk",
        _ => "unknown",
    }
}

/// Axum middleware that records HTTP request metrics.
pub async fn http_metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let metrics = &state.metrics;

    let method = request.method().to_string();
    let operation = classify_operation(&method, request.uri().path());

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();

    metrics
        .http_requests_total
        .with_label_values(&[&method, &status, operation])
        .inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(&[&method, operation])
        .observe(duration);

    response
}

/// Handler for GET /metrics — returns Prometheus text format.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = &state.metrics;

    // Refresh on scrape so evictions show up
    metrics
        .upload_active_sessions
        .set(state.sessions.session_count() as i64);

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (StatusCode::OK, [("content-type", TEXT_FORMAT)], buffer).into_response()
}

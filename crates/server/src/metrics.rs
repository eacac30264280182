//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring a castfleet process:
//! - HTTP request metrics (latency, counts, errors)
//! - Control protocol rejections
//! - Fleet and worker status (collected dynamically)

use chrono::Utc;
use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tracing::warn;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "castfleet_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("castfleet_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "castfleet_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Control Protocol Metrics
// =============================================================================

/// RPC requests this process refused, by endpoint and reason.
pub static RPC_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "castfleet_rpc_rejections_total",
            "Control protocol requests answered with ok=false",
        ),
        &["endpoint", "reason"], // reason: "identity", "malformed", "busy", "error"
    )
    .unwrap()
});

// =============================================================================
// Fleet Metrics (collected dynamically, coordinator role)
// =============================================================================

/// Registered workers by liveness.
pub static WORKERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("castfleet_workers", "Registered workers by liveness"),
        &["state"], // "alive", "stale"
    )
    .unwrap()
});

/// Workload per registered worker.
pub static WORKER_WORKLOAD: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("castfleet_worker_workload", "Workload units per worker"),
        &["worker_id"],
    )
    .unwrap()
});

/// Ingest slots by state.
pub static INGEST_SLOTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("castfleet_ingest_slots", "Ingest slots by state"),
        &["state"], // "free", "bound"
    )
    .unwrap()
});

// =============================================================================
// Worker Metrics (collected dynamically, worker role)
// =============================================================================

/// Workload this worker reports.
pub static LOCAL_WORKLOAD: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "castfleet_local_workload",
        "Workload units currently held by this worker",
    )
    .unwrap()
});

/// Whether this worker is draining (1) or taking work (0).
pub static LOCAL_DRAINING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "castfleet_local_draining",
        "Whether the worker is draining (1) or accepting work (0)",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // Control protocol
    registry
        .register(Box::new(RPC_REJECTIONS_TOTAL.clone()))
        .unwrap();

    // Fleet
    registry.register(Box::new(WORKERS.clone())).unwrap();
    registry
        .register(Box::new(WORKER_WORKLOAD.clone()))
        .unwrap();
    registry.register(Box::new(INGEST_SLOTS.clone())).unwrap();

    // Worker
    registry.register(Box::new(LOCAL_WORKLOAD.clone())).unwrap();
    registry.register(Box::new(LOCAL_DRAINING.clone())).unwrap();

    // Core metrics (scheduler, pipeline, deletion queue)
    for metric in castfleet_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Collect dynamic metrics from current application state.
///
/// Called before encoding so gauges reflect the registries and the
/// worker's ledger at scrape time.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    if let Some(coordinator) = state.coordinator() {
        let window = coordinator.scheduler.config().liveness_window();
        let now = Utc::now();
        if let Ok(workers) = coordinator.workers.list() {
            let alive = workers
                .iter()
                .filter(|w| w.is_alive_at(now, window))
                .count() as i64;
            WORKERS.with_label_values(&["alive"]).set(alive);
            WORKERS
                .with_label_values(&["stale"])
                .set(workers.len() as i64 - alive);
            WORKER_WORKLOAD.reset();
            for worker in &workers {
                WORKER_WORKLOAD
                    .with_label_values(&[&worker.id])
                    .set(worker.workload);
            }
        }
        if let Ok(slots) = coordinator.slots.list_slots() {
            let free = slots.iter().filter(|s| s.is_free()).count() as i64;
            INGEST_SLOTS.with_label_values(&["free"]).set(free);
            INGEST_SLOTS
                .with_label_values(&["bound"])
                .set(slots.len() as i64 - free);
        }
    }

    if let Some(engine) = state.worker() {
        let status = engine.status();
        LOCAL_WORKLOAD.set(status.workload);
        LOCAL_DRAINING.set(if status.draining { 1 } else { 0 });
    }
}

/// Normalize a path for metric labels (replace IDs with placeholders).
pub fn normalize_path(path: &str) -> String {
    static NUMERIC: Lazy<regex_lite::Regex> =
        Lazy::new(|| regex_lite::Regex::new(r"/\d+(/|$)").unwrap());

    NUMERIC.replace_all(path, "/{id}$1").to_string()
}

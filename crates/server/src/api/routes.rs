use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{admin, coordinator, handlers, middleware::metrics_middleware, worker};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Admin API routes
    let api_routes = Router::new()
        // Health and config
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        // Dispatch and registries
        .route("/dispatch", post(admin::dispatch))
        .route("/workers", get(admin::list_workers))
        .route("/slots", get(admin::list_slots))
        .route("/slots/release", post(admin::release_slots))
        .route("/slots/orphans", get(admin::orphaned_slots))
        .route("/ingest", post(admin::add_ingest))
        // Streams
        .route("/streams", post(admin::create_stream))
        .route("/streams/{id}", get(admin::get_stream))
        .route("/streams/{id}/stop", post(admin::stop_stream))
        // Ad-hoc jobs
        .route("/streams/{id}/thumbnails", post(admin::thumbnails))
        .route("/streams/{id}/section-images", post(admin::section_images))
        .route("/streams/{id}/waveform", post(admin::waveform))
        .route("/live-preview", post(admin::live_preview))
        .route("/section-images/delete", post(admin::delete_section_image));

    // Worker -> coordinator
    let coordinator_routes = Router::new()
        .route("/register", post(coordinator::register))
        .route("/heartbeat", post(coordinator::heartbeat))
        .route("/stream-started", post(coordinator::stream_started))
        .route("/stream-finished", post(coordinator::stream_finished))
        .route("/transcoding-finished", post(coordinator::transcoding_finished))
        .route("/publish-finished", post(coordinator::publish_finished))
        .route("/silence-results", post(coordinator::silence_results))
        .route("/stage-failed", post(coordinator::stage_failed));

    // Coordinator -> worker
    let worker_routes = Router::new()
        .route("/status", get(worker::status))
        .route("/assign-stream", post(worker::assign_stream))
        .route("/cancel-stream", post(worker::cancel_stream))
        .route("/assign-premiere", post(worker::assign_premiere))
        .route("/thumbnails", post(worker::thumbnails))
        .route("/live-preview", post(worker::live_preview))
        .route("/section-images", post(worker::section_images))
        .route("/section-images/delete", post(worker::delete_section_image))
        .route("/waveform", post(worker::waveform));

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/rpc/coordinator", coordinator_routes)
        .nest("/rpc/worker", worker_routes)
        .route("/metrics", get(handlers::metrics))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

//! Worker side of the control protocol (`/rpc/worker/*`).

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use tracing::warn;

use castfleet_core::rpc::{
    Ack, AssignPremiereRequest, AssignStreamRequest, CancelStreamRequest, CancelStreamResponse,
    DeleteSectionImageRequest, GenerateThumbnailsRequest, LivePreviewRequest,
    LivePreviewResponse, SectionImagesRequest, SectionImagesResponse, ThumbnailsResponse,
    WaveformRequest, WaveformResponse, WorkerStatus,
};
use castfleet_core::{PipelineEngine, PipelineError};

use super::coordinator::RpcRejection;
use crate::metrics::RPC_REJECTIONS_TOTAL;
use crate::state::AppState;

fn status_for(error: &PipelineError) -> (StatusCode, &'static str) {
    match error {
        PipelineError::IdentityMismatch => (StatusCode::FORBIDDEN, "identity"),
        PipelineError::Malformed(_) => (StatusCode::BAD_REQUEST, "malformed"),
        PipelineError::AlreadyAssigned { .. } => (StatusCode::CONFLICT, "busy"),
        PipelineError::Draining => (StatusCode::SERVICE_UNAVAILABLE, "busy"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "error"),
    }
}

fn reject(endpoint: &str, error: PipelineError) -> RpcRejection {
    let (status, label) = status_for(&error);
    warn!(endpoint, error = %error, "Rejecting worker call");
    RPC_REJECTIONS_TOTAL
        .with_label_values(&[endpoint, label])
        .inc();
    (status, Json(Ack::rejected(error.rejection_reason())))
}

fn engine(state: &AppState) -> Result<&Arc<PipelineEngine>, RpcRejection> {
    state.worker().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Ack::rejected("worker role is not enabled")),
        )
    })
}

// ============================================================================
// Assignments
// ============================================================================

pub async fn assign_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AssignStreamRequest>,
) -> Result<Json<Ack>, RpcRejection> {
    engine(&state)?
        .assign_stream(req)
        .await
        .map(|()| Json(Ack::ok()))
        .map_err(|e| reject("assign-stream", e))
}

pub async fn assign_premiere(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AssignPremiereRequest>,
) -> Result<Json<Ack>, RpcRejection> {
    engine(&state)?
        .assign_premiere(req)
        .await
        .map(|()| Json(Ack::ok()))
        .map_err(|e| reject("assign-premiere", e))
}

pub async fn cancel_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CancelStreamRequest>,
) -> Result<Json<CancelStreamResponse>, RpcRejection> {
    engine(&state)?
        .cancel_stream(&req)
        .await
        .map(|cancelled| Json(CancelStreamResponse { ok: true, cancelled }))
        .map_err(|e| reject("cancel-stream", e))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<WorkerStatus>, RpcRejection> {
    Ok(Json(engine(&state)?.status()))
}

// ============================================================================
// Ad-hoc jobs
// ============================================================================

pub async fn thumbnails(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateThumbnailsRequest>,
) -> Result<Json<ThumbnailsResponse>, RpcRejection> {
    engine(&state)?
        .generate_thumbnails(&req)
        .await
        .map(Json)
        .map_err(|e| reject("thumbnails", e))
}

pub async fn live_preview(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LivePreviewRequest>,
) -> Result<Json<LivePreviewResponse>, RpcRejection> {
    engine(&state)?
        .live_preview(&req)
        .await
        .map(Json)
        .map_err(|e| reject("live-preview", e))
}

pub async fn section_images(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SectionImagesRequest>,
) -> Result<Json<SectionImagesResponse>, RpcRejection> {
    engine(&state)?
        .section_images(&req)
        .await
        .map(Json)
        .map_err(|e| reject("section-images", e))
}

pub async fn delete_section_image(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteSectionImageRequest>,
) -> Result<Json<Ack>, RpcRejection> {
    engine(&state)?
        .delete_section_image(&req)
        .await
        .map(|()| Json(Ack::ok()))
        .map_err(|e| reject("section-images/delete", e))
}

pub async fn waveform(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WaveformRequest>,
) -> Result<Json<WaveformResponse>, RpcRejection> {
    engine(&state)?
        .waveform(&req)
        .await
        .map(Json)
        .map_err(|e| reject("waveform", e))
}

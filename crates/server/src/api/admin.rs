//! Coordinator admin API handlers (`/api/v1/...`).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use castfleet_core::registry::{IngestServer, IngestSlot, StoreError, Worker};
use castfleet_core::rpc::{
    LivePreviewResponse, SectionImagesResponse, ThumbnailsResponse, WaveformResponse,
};
use castfleet_core::scheduler::StopReport;
use castfleet_core::streams::{NewStream, Stream};
use castfleet_core::{PassReport, SchedulerError};

use crate::state::{AppState, CoordinatorHandle};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Error response
#[derive(Debug, Serialize)]
pub struct AdminErrorResponse {
    pub error: String,
}

pub type AdminError = (StatusCode, Json<AdminErrorResponse>);

/// Request body for stopping a stream
#[derive(Debug, Default, Deserialize)]
pub struct StopStreamBody {
    /// Throw recordings away instead of transcoding them
    #[serde(default)]
    pub discard: bool,
}

/// One slot in an ingest registration
#[derive(Debug, Deserialize)]
pub struct SlotBody {
    pub name: String,
    #[serde(default)]
    pub transcoding: bool,
}

/// Request body for adding an ingest server with its slots
#[derive(Debug, Deserialize)]
pub struct AddIngestBody {
    pub url: String,
    #[serde(default)]
    pub slots: Vec<SlotBody>,
}

#[derive(Debug, Serialize)]
pub struct AddIngestResponse {
    pub server: IngestServer,
    pub slots: Vec<IngestSlot>,
}

#[derive(Debug, Serialize)]
pub struct CreateStreamResponse {
    pub id: i64,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub released: usize,
}

#[derive(Debug, Deserialize)]
pub struct FileJobBody {
    pub file_path: String,
}

#[derive(Debug, Deserialize)]
pub struct SectionImagesBody {
    pub file_path: String,
    pub timestamps: Vec<u32>,
}

#[derive(Debug, Deserialize)]
pub struct LivePreviewBody {
    pub source_url: String,
    #[serde(default)]
    pub tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteSectionImageBody {
    pub worker_id: String,
    pub path: String,
}

// ============================================================================
// Helpers
// ============================================================================

fn error(status: StatusCode, message: impl Into<String>) -> AdminError {
    (
        status,
        Json(AdminErrorResponse {
            error: message.into(),
        }),
    )
}

fn coordinator(state: &AppState) -> Result<&CoordinatorHandle, AdminError> {
    state.coordinator().ok_or_else(|| {
        error(
            StatusCode::SERVICE_UNAVAILABLE,
            "coordinator role is not enabled",
        )
    })
}

fn store_error(e: StoreError) -> AdminError {
    match e {
        StoreError::NotFound(_) => error(StatusCode::NOT_FOUND, e.to_string()),
        StoreError::Conflict(_) => error(StatusCode::CONFLICT, e.to_string()),
        _ => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn scheduler_error(e: SchedulerError) -> AdminError {
    let status = match &e {
        SchedulerError::StreamNotFound(_) | SchedulerError::WorkerNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        SchedulerError::Malformed(_) => StatusCode::BAD_REQUEST,
        SchedulerError::NoEligibleWorker => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::Rpc(_) => StatusCode::BAD_GATEWAY,
        SchedulerError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(status, e.to_string())
}

// ============================================================================
// Dispatch and slots
// ============================================================================

/// Run one dispatch pass now
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PassReport>, AdminError> {
    let report = coordinator(&state)?
        .scheduler
        .run_pass(Utc::now())
        .await
        .map_err(scheduler_error)?;
    Ok(Json(report))
}

pub async fn list_workers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Worker>>, AdminError> {
    let workers = coordinator(&state)?.workers.list().map_err(store_error)?;
    Ok(Json(workers))
}

pub async fn list_slots(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<IngestSlot>>, AdminError> {
    let slots = coordinator(&state)?.slots.list_slots().map_err(store_error)?;
    Ok(Json(slots))
}

/// Register an ingest server and its slots
pub async fn add_ingest(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddIngestBody>,
) -> Result<(StatusCode, Json<AddIngestResponse>), AdminError> {
    if body.url.trim().is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "url must not be empty"));
    }
    if body.slots.iter().any(|s| s.name.trim().is_empty()) {
        return Err(error(StatusCode::BAD_REQUEST, "slot names must not be empty"));
    }

    let registry = &coordinator(&state)?.slots;
    let server = registry.add_server(&body.url).map_err(store_error)?;
    let mut slots = Vec::with_capacity(body.slots.len());
    for slot in &body.slots {
        slots.push(
            registry
                .add_slot(server.id, &slot.name, slot.transcoding)
                .map_err(store_error)?,
        );
    }
    info!(server = %server.url, slots = slots.len(), "Added ingest server");

    Ok((StatusCode::CREATED, Json(AddIngestResponse { server, slots })))
}

/// Release bound slots past their cooldown
pub async fn release_slots(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReleaseResponse>, AdminError> {
    let released = coordinator(&state)?
        .scheduler
        .release_expired_slots(Utc::now())
        .map_err(scheduler_error)?;
    Ok(Json(ReleaseResponse { released }))
}

pub async fn orphaned_slots(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<IngestSlot>>, AdminError> {
    let orphans = coordinator(&state)?
        .scheduler
        .find_orphaned_slots(Utc::now())
        .await
        .map_err(scheduler_error)?;
    Ok(Json(orphans))
}

// ============================================================================
// Streams
// ============================================================================

pub async fn create_stream(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewStream>,
) -> Result<(StatusCode, Json<CreateStreamResponse>), AdminError> {
    if body.end <= body.start {
        return Err(error(StatusCode::BAD_REQUEST, "stream must end after it starts"));
    }
    if body.sources.is_empty() && body.premiere_file.is_none() {
        return Err(error(
            StatusCode::BAD_REQUEST,
            "stream needs sources or a premiere file",
        ));
    }
    let id = coordinator(&state)?
        .streams
        .create_stream(&body)
        .map_err(store_error)?;
    info!(stream_id = id, course = %body.course_slug, "Created stream");
    Ok((StatusCode::CREATED, Json(CreateStreamResponse { id })))
}

pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Stream>, AdminError> {
    coordinator(&state)?
        .streams
        .get_stream(id)
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("stream not found: {}", id)))
}

/// Cancel every running assignment of a stream
pub async fn stop_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Option<Json<StopStreamBody>>,
) -> Result<Json<StopReport>, AdminError> {
    let discard = body.map(|Json(b)| b.discard).unwrap_or_default();
    let report = coordinator(&state)?
        .scheduler
        .stop_stream(id, discard)
        .await
        .map_err(scheduler_error)?;
    Ok(Json(report))
}

// ============================================================================
// Ad-hoc jobs
// ============================================================================

pub async fn thumbnails(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<FileJobBody>,
) -> Result<Json<ThumbnailsResponse>, AdminError> {
    coordinator(&state)?
        .scheduler
        .generate_thumbnails(id, &body.file_path)
        .await
        .map(Json)
        .map_err(scheduler_error)
}

pub async fn section_images(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<SectionImagesBody>,
) -> Result<Json<SectionImagesResponse>, AdminError> {
    coordinator(&state)?
        .scheduler
        .section_images(id, &body.file_path, body.timestamps)
        .await
        .map(Json)
        .map_err(scheduler_error)
}

pub async fn waveform(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<FileJobBody>,
) -> Result<Json<WaveformResponse>, AdminError> {
    coordinator(&state)?
        .scheduler
        .waveform(id, &body.file_path)
        .await
        .map(Json)
        .map_err(scheduler_error)
}

pub async fn live_preview(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LivePreviewBody>,
) -> Result<Json<LivePreviewResponse>, AdminError> {
    coordinator(&state)?
        .scheduler
        .live_preview(&body.source_url, body.tenant.as_deref())
        .await
        .map(Json)
        .map_err(scheduler_error)
}

pub async fn delete_section_image(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeleteSectionImageBody>,
) -> Result<StatusCode, AdminError> {
    coordinator(&state)?
        .scheduler
        .delete_section_image(&body.worker_id, &body.path)
        .await
        .map_err(scheduler_error)?;
    Ok(StatusCode::NO_CONTENT)
}

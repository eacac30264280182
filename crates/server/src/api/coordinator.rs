//! Coordinator side of the control protocol (`/rpc/coordinator/*`).
//!
//! Workers call these endpoints to register, report liveness and report
//! pipeline progress. A rejected call answers with a non-2xx status and an
//! `{"ok": false, "reason": ...}` body.

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use tracing::warn;

use castfleet_core::rpc::{
    Ack, HeartbeatRequest, PublishFinishedRequest, RegisterRequest, SilenceResultsRequest,
    StageFailedRequest, StreamFinishedRequest, StreamStartedRequest, TranscodingFinishedRequest,
};
use castfleet_core::{CoordinatorService, SchedulerError};

use crate::metrics::RPC_REJECTIONS_TOTAL;
use crate::state::AppState;

pub type RpcRejection = (StatusCode, Json<Ack>);

fn status_for(error: &SchedulerError) -> (StatusCode, &'static str) {
    match error {
        SchedulerError::IdentityMismatch => (StatusCode::FORBIDDEN, "identity"),
        SchedulerError::Malformed(_) => (StatusCode::BAD_REQUEST, "malformed"),
        SchedulerError::StreamNotFound(_) | SchedulerError::WorkerNotFound(_) => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        SchedulerError::NoEligibleWorker => (StatusCode::SERVICE_UNAVAILABLE, "busy"),
        SchedulerError::Store(_) | SchedulerError::Rpc(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "error")
        }
    }
}

pub(crate) fn reject(endpoint: &str, error: SchedulerError) -> RpcRejection {
    let (status, label) = status_for(&error);
    warn!(endpoint, error = %error, "Rejecting coordinator call");
    RPC_REJECTIONS_TOTAL
        .with_label_values(&[endpoint, label])
        .inc();
    (status, Json(Ack::rejected(error.rejection_reason())))
}

fn service(state: &AppState) -> Result<&Arc<CoordinatorService>, RpcRejection> {
    state.coordinator().map(|c| &c.service).ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Ack::rejected("coordinator role is not enabled")),
        )
    })
}

fn respond(endpoint: &str, result: Result<(), SchedulerError>) -> Result<Json<Ack>, RpcRejection> {
    result
        .map(|()| Json(Ack::ok()))
        .map_err(|e| reject(endpoint, e))
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Ack>, RpcRejection> {
    let result = service(&state)?.register(&req).map(|_| ());
    respond("register", result)
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<Ack>, RpcRejection> {
    let result = service(&state)?.heartbeat(&req).map(|_| ());
    respond("heartbeat", result)
}

pub async fn stream_started(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StreamStartedRequest>,
) -> Result<Json<Ack>, RpcRejection> {
    respond("stream-started", service(&state)?.stream_started(&req))
}

pub async fn stream_finished(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StreamFinishedRequest>,
) -> Result<Json<Ack>, RpcRejection> {
    respond("stream-finished", service(&state)?.stream_finished(&req))
}

pub async fn transcoding_finished(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TranscodingFinishedRequest>,
) -> Result<Json<Ack>, RpcRejection> {
    respond(
        "transcoding-finished",
        service(&state)?.transcoding_finished(&req),
    )
}

pub async fn publish_finished(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PublishFinishedRequest>,
) -> Result<Json<Ack>, RpcRejection> {
    respond("publish-finished", service(&state)?.publish_finished(&req))
}

pub async fn silence_results(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SilenceResultsRequest>,
) -> Result<Json<Ack>, RpcRejection> {
    respond("silence-results", service(&state)?.silence_results(&req))
}

pub async fn stage_failed(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StageFailedRequest>,
) -> Result<Json<Ack>, RpcRejection> {
    respond("stage-failed", service(&state)?.stage_failed(&req))
}

//! Wire types for the coordinator/worker control protocol.
//!
//! Every request carries the worker identity (`worker_id`). The receiving
//! side rejects requests whose identity does not match with
//! `{"ok": false, "reason": "identity mismatch"}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::streams::SourceVariant;

/// Reason string used for identity rejections.
pub const IDENTITY_MISMATCH: &str = "identity mismatch";

/// Generic acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// Host utilization reported with each heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostStats {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub uptime_secs: u64,
}

// ---------------------------------------------------------------------------
// Coordinator -> worker
// ---------------------------------------------------------------------------

/// Record (and optionally live-publish) one source of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignStreamRequest {
    pub worker_id: String,
    pub stream_id: i64,
    pub course_slug: String,
    /// Lecture name, used for file names and job descriptions.
    pub stream_name: String,
    pub source_type: SourceVariant,
    pub source_url: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub publish_live: bool,
    pub publish_vod: bool,
    /// Ingest slot name (stream key) bound to this assignment.
    pub slot_name: String,
    /// Ingest server push base URL.
    pub ingest_server: String,
}

/// Stop a running assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelStreamRequest {
    pub worker_id: String,
    pub stream_id: i64,
    /// When set, only the assignment bound to this slot is cancelled.
    #[serde(default)]
    pub slot_name: Option<String>,
    /// Throw the recording away instead of transcoding it.
    #[serde(default)]
    pub discard: bool,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelStreamResponse {
    pub ok: bool,
    /// Number of assignments that were running and are now cancelled.
    pub cancelled: usize,
}

/// Replay a pre-recorded file as a live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignPremiereRequest {
    pub worker_id: String,
    pub stream_id: i64,
    pub course_slug: String,
    pub stream_name: String,
    pub file_path: String,
    pub end: DateTime<Utc>,
    pub slot_name: String,
    pub ingest_server: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateThumbnailsRequest {
    pub worker_id: String,
    pub stream_id: i64,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailsResponse {
    pub ok: bool,
    /// Sprite sheet of evenly spaced frames for the scrubbing bar.
    pub sprite_path: String,
    /// Single frame used as the VOD poster.
    pub thumbnail_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePreviewRequest {
    pub worker_id: String,
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePreviewResponse {
    pub ok: bool,
    /// JPEG bytes, base64-encoded.
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionImagesRequest {
    pub worker_id: String,
    pub stream_id: i64,
    pub file_path: String,
    /// Offsets in seconds.
    pub timestamps: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionImagesResponse {
    pub ok: bool,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteSectionImageRequest {
    pub worker_id: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformRequest {
    pub worker_id: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformResponse {
    pub ok: bool,
    /// PNG bytes, base64-encoded.
    pub waveform: String,
}

/// What a worker reports about itself on `GET /rpc/worker/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub workload: i64,
    pub jobs: Vec<String>,
    pub stats: HostStats,
    pub version: String,
    pub draining: bool,
}

// ---------------------------------------------------------------------------
// Worker -> coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub worker_id: String,
    pub address: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    pub address: String,
    pub workload: i64,
    pub jobs: Vec<String>,
    pub version: String,
    pub stats: HostStats,
    /// Placement, so a worker that missed registration is still scheduled
    /// for its tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default)]
    pub shared: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStartedRequest {
    pub worker_id: String,
    pub stream_id: i64,
    pub source_type: SourceVariant,
    pub slot_name: String,
    /// Playback URL of the live stream, if it is being published.
    #[serde(default)]
    pub live_url: Option<String>,
    #[serde(default)]
    pub premiere: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFinishedRequest {
    pub worker_id: String,
    pub stream_id: i64,
    pub source_type: SourceVariant,
    pub slot_name: String,
    #[serde(default)]
    pub premiere: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodingFinishedRequest {
    pub worker_id: String,
    pub stream_id: i64,
    pub source_type: SourceVariant,
    pub file_path: String,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishFinishedRequest {
    pub worker_id: String,
    pub stream_id: i64,
    pub source_type: SourceVariant,
    pub vod_url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilenceResultsRequest {
    pub worker_id: String,
    pub stream_id: i64,
    pub starts: Vec<u32>,
    pub ends: Vec<u32>,
}

/// A pipeline stage failed. The pipeline continues or stops per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailedRequest {
    pub worker_id: String,
    pub stream_id: i64,
    pub source_type: SourceVariant,
    pub stage: String,
    pub error: String,
}

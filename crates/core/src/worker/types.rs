//! Pipeline engine types.

use std::fmt;
use thiserror::Error;

use super::encoder::EncoderError;
use super::publish::PublishError;
use crate::deletion::DeletionQueueError;
use crate::rpc::IDENTITY_MISMATCH;
use crate::silence::SilenceParseError;
use crate::streams::SourceVariant;

/// Errors surfaced by the pipeline engine.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The request was addressed to another worker.
    #[error("identity mismatch")]
    IdentityMismatch,

    #[error("malformed assignment: {0}")]
    Malformed(String),

    /// The worker is shutting down and takes no new work.
    #[error("worker is draining")]
    Draining,

    /// An assignment for the same stream and source is already running.
    #[error("stream {stream_id} ({variant}) is already assigned to this worker")]
    AlreadyAssigned {
        stream_id: i64,
        variant: SourceVariant,
    },

    #[error("{stage} failed: {source}")]
    Encoder {
        stage: Stage,
        #[source]
        source: EncoderError,
    },

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("silence analysis failed: {0}")]
    Silence(#[from] SilenceParseError),

    #[error("deletion queue error: {0}")]
    Deletion(#[from] DeletionQueueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn encoder(stage: Stage, source: EncoderError) -> Self {
        Self::Encoder { stage, source }
    }

    /// Reason string sent back over RPC for rejected requests.
    pub fn rejection_reason(&self) -> String {
        match self {
            PipelineError::IdentityMismatch => IDENTITY_MISMATCH.to_string(),
            other => other.to_string(),
        }
    }
}

/// Pipeline stage names, used in job descriptions, logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Capture,
    Premiere,
    Transcode,
    Publish,
    SilenceAnalyze,
    MarkForDeletion,
    Thumbnails,
    LivePreview,
    SectionImages,
    Waveform,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Capture => "capture",
            Stage::Premiere => "premiere",
            Stage::Transcode => "transcode",
            Stage::Publish => "publish",
            Stage::SilenceAnalyze => "silence_analyze",
            Stage::MarkForDeletion => "mark_for_deletion",
            Stage::Thumbnails => "thumbnails",
            Stage::LivePreview => "live_preview",
            Stage::SectionImages => "section_images",
            Stage::Waveform => "waveform",
        }
    }

    /// Workload units the stage occupies while it runs.
    pub fn cost(&self) -> i64 {
        match self {
            Stage::Capture | Stage::Premiere => 3,
            Stage::Transcode | Stage::Thumbnails => 2,
            Stage::Publish
            | Stage::SilenceAnalyze
            | Stage::LivePreview
            | Stage::SectionImages
            | Stage::Waveform => 1,
            Stage::MarkForDeletion => 0,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies an in-flight assignment on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssignmentKey {
    pub stream_id: i64,
    pub variant: SourceVariant,
}

impl fmt::Display for AssignmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream_id, self.variant)
    }
}

/// How an assignment's pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// All applicable stages ran.
    Completed,
    /// Cancelled with discard; the raw capture was marked for deletion.
    Discarded,
    /// A stage failed and the remaining stages were skipped.
    Aborted(Stage),
}

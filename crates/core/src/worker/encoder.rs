//! Media encoder abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::streams::SourceVariant;

/// Errors from encoder subprocesses.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The binary could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited unsuccessfully.
    #[error("{program} exited with status {status:?}: {stderr}")]
    ProcessFailed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {timeout_secs} seconds")]
    Timeout { program: String, timeout_secs: u64 },

    #[error("failed to probe media: {reason}")]
    ProbeFailed { reason: String },

    #[error("expected output missing: {path}")]
    MissingOutput { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncoderError {
    pub fn process_failed(program: impl Into<String>, status: Option<i32>, stderr: &str) -> Self {
        Self::ProcessFailed {
            program: program.into(),
            status,
            // Keep the tail, that is where ffmpeg says what went wrong
            stderr: tail(stderr, 1024),
        }
    }
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.trim().to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].trim().to_string()
}

/// Where a capture reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureInput {
    /// A live network source (RTSP/RTMP/HLS).
    Live(String),
    /// A pre-recorded file, replayed at native speed.
    File(PathBuf),
}

/// One capture invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureJob {
    pub input: CaptureInput,
    /// Raw recording file. Bytes are appended, so retries extend it.
    pub output: Option<PathBuf>,
    /// Ingest push URL for live publishing. Push failures do not stop the
    /// recording.
    pub push_url: Option<String>,
    /// The subprocess is terminated at this instant.
    pub deadline: DateTime<Utc>,
}

/// How a capture invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureExit {
    /// The subprocess exited on its own (source ended or dropped).
    Ended,
    /// The cancellation token fired.
    Cancelled,
    /// The deadline passed.
    DeadlineReached,
}

/// One VOD transcode.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub variant: SourceVariant,
}

/// Runs the media tooling used by the pipeline.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Returns the name of this encoder implementation.
    fn name(&self) -> &str;

    /// Run one capture attempt.
    ///
    /// Cancellation and the deadline terminate the whole subprocess tree.
    async fn capture(
        &self,
        job: &CaptureJob,
        cancel: &CancellationToken,
    ) -> Result<CaptureExit, EncoderError>;

    /// Transcode a raw recording to a VOD file, at reduced CPU priority.
    async fn transcode(&self, job: &TranscodeJob) -> Result<(), EncoderError>;

    /// Media duration in seconds.
    async fn probe_duration(&self, path: &Path) -> Result<f64, EncoderError>;

    /// Run the silence analyzer and return its raw text output.
    async fn detect_silence(
        &self,
        path: &Path,
        noise_db: f64,
        min_duration_secs: f64,
    ) -> Result<String, EncoderError>;

    /// Write a thumbnail sprite sheet and a poster frame.
    async fn thumbnails(
        &self,
        input: &Path,
        sprite: &Path,
        poster: &Path,
    ) -> Result<(), EncoderError>;

    /// Grab one JPEG frame from a live source.
    async fn live_preview(&self, source_url: &str) -> Result<Vec<u8>, EncoderError>;

    /// Extract the frame at `at_secs` into `output`.
    async fn section_image(
        &self,
        input: &Path,
        at_secs: u32,
        output: &Path,
    ) -> Result<(), EncoderError>;

    /// Render the audio waveform as PNG.
    async fn waveform(&self, input: &Path) -> Result<Vec<u8>, EncoderError>;
}

//! Mock encoder for testing the worker pipeline.

use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::worker::{CaptureExit, CaptureJob, Encoder, EncoderError, TranscodeJob};

/// Mock implementation of the Encoder trait.
///
/// Captures append a few bytes to their output file and then block until
/// the job deadline or cancellation, like a real recording would. All
/// other operations write small placeholder files.
///
/// # Example
///
/// ```rust,ignore
/// use castfleet_core::testing::MockEncoder;
///
/// let encoder = MockEncoder::new();
/// encoder.fail_next_captures(2).await;
/// encoder.set_silence_output("silence_start: 10\nsilence_end: 20\n").await;
/// ```
#[derive(Debug)]
pub struct MockEncoder {
    captures: Arc<RwLock<Vec<CaptureJob>>>,
    transcodes: Arc<RwLock<Vec<TranscodeJob>>>,
    /// Number of upcoming capture attempts that fail to start.
    failing_captures: Arc<RwLock<usize>>,
    fail_transcode: Arc<RwLock<bool>>,
    /// Whether captures write anything to their output.
    capture_writes: Arc<RwLock<bool>>,
    /// Raw analyzer output returned by `detect_silence`.
    silence_output: Arc<RwLock<String>>,
    preview_bytes: Arc<RwLock<Vec<u8>>>,
    /// Fail thumbnails, previews, section images and waveforms.
    fail_jobs: Arc<RwLock<bool>>,
}

impl Default for MockEncoder {
    fn default() -> Self {
        Self {
            captures: Arc::new(RwLock::new(Vec::new())),
            transcodes: Arc::new(RwLock::new(Vec::new())),
            failing_captures: Arc::new(RwLock::new(0)),
            fail_transcode: Arc::new(RwLock::new(false)),
            capture_writes: Arc::new(RwLock::new(true)),
            silence_output: Arc::new(RwLock::new(String::new())),
            preview_bytes: Arc::new(RwLock::new(vec![0xff, 0xd8, 0xff, 0xe0])),
            fail_jobs: Arc::new(RwLock::new(false)),
        }
    }
}

impl MockEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All capture attempts, including failed ones.
    pub async fn captures(&self) -> Vec<CaptureJob> {
        self.captures.read().await.clone()
    }

    pub async fn transcodes(&self) -> Vec<TranscodeJob> {
        self.transcodes.read().await.clone()
    }

    pub async fn set_silence_output(&self, output: &str) {
        *self.silence_output.write().await = output.to_string();
    }

    pub async fn fail_next_captures(&self, count: usize) {
        *self.failing_captures.write().await = count;
    }

    pub async fn fail_transcode(&self, fail: bool) {
        *self.fail_transcode.write().await = fail;
    }

    pub async fn set_capture_writes(&self, writes: bool) {
        *self.capture_writes.write().await = writes;
    }

    pub async fn set_preview_bytes(&self, bytes: Vec<u8>) {
        *self.preview_bytes.write().await = bytes;
    }

    pub async fn fail_jobs(&self, fail: bool) {
        *self.fail_jobs.write().await = fail;
    }

    async fn check_jobs(&self) -> Result<(), EncoderError> {
        if *self.fail_jobs.read().await {
            return Err(EncoderError::process_failed("ffmpeg", Some(1), "mock failure"));
        }
        Ok(())
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), EncoderError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}

#[async_trait]
impl Encoder for MockEncoder {
    fn name(&self) -> &str {
        "mock"
    }

    async fn capture(
        &self,
        job: &CaptureJob,
        cancel: &CancellationToken,
    ) -> Result<CaptureExit, EncoderError> {
        self.captures.write().await.push(job.clone());

        {
            let mut failing = self.failing_captures.write().await;
            if *failing > 0 {
                *failing -= 1;
                return Err(EncoderError::process_failed(
                    "ffmpeg",
                    Some(1),
                    "Connection refused",
                ));
            }
        }

        let remaining = job.deadline - Utc::now();
        let Ok(remaining) = remaining.to_std() else {
            return Ok(CaptureExit::DeadlineReached);
        };

        if let Some(ref output) = job.output {
            if *self.capture_writes.read().await {
                if let Some(parent) = output.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(output)
                    .await?;
                file.write_all(b"mpegts").await?;
                file.flush().await?;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => Ok(CaptureExit::Cancelled),
            _ = tokio::time::sleep(remaining) => Ok(CaptureExit::DeadlineReached),
        }
    }

    async fn transcode(&self, job: &TranscodeJob) -> Result<(), EncoderError> {
        self.transcodes.write().await.push(job.clone());
        if *self.fail_transcode.read().await {
            return Err(EncoderError::process_failed(
                "ffmpeg",
                Some(1),
                "Invalid data found when processing input",
            ));
        }
        write_file(&job.output, b"mp4").await
    }

    async fn probe_duration(&self, _path: &Path) -> Result<f64, EncoderError> {
        Ok(3600.0)
    }

    async fn detect_silence(
        &self,
        _path: &Path,
        _noise_db: f64,
        _min_duration_secs: f64,
    ) -> Result<String, EncoderError> {
        Ok(self.silence_output.read().await.clone())
    }

    async fn thumbnails(
        &self,
        _input: &Path,
        sprite: &Path,
        poster: &Path,
    ) -> Result<(), EncoderError> {
        self.check_jobs().await?;
        write_file(sprite, b"jpeg").await?;
        write_file(poster, b"jpeg").await
    }

    async fn live_preview(&self, _source_url: &str) -> Result<Vec<u8>, EncoderError> {
        self.check_jobs().await?;
        Ok(self.preview_bytes.read().await.clone())
    }

    async fn section_image(
        &self,
        _input: &Path,
        _at_secs: u32,
        output: &Path,
    ) -> Result<(), EncoderError> {
        self.check_jobs().await?;
        write_file(output, b"jpeg").await
    }

    async fn waveform(&self, _input: &Path) -> Result<Vec<u8>, EncoderError> {
        self.check_jobs().await?;
        Ok(vec![0x89, b'P', b'N', b'G'])
    }
}

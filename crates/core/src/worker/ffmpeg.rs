//! FFmpeg-based encoder implementation.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::config::EncoderConfig;
use super::encoder::{
    CaptureExit, CaptureInput, CaptureJob, Encoder, EncoderError, TranscodeJob,
};
use super::process::{GroupChild, WaitOutcome};
use crate::streams::SourceVariant;

/// Lines of ffmpeg stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Number of frames in a thumbnail sprite (10x10 grid).
const SPRITE_FRAMES: f64 = 100.0;

/// FFmpeg-based encoder.
pub struct FfmpegEncoder {
    config: EncoderConfig,
}

impl FfmpegEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(EncoderConfig::default())
    }

    fn ffmpeg_program(&self) -> String {
        self.config.ffmpeg_path.to_string_lossy().to_string()
    }

    fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.config.job_timeout_secs)
    }

    /// Input options that depend on the source protocol.
    fn input_args(url: &str) -> Vec<String> {
        if url.starts_with("rtsp://") {
            vec!["-rtsp_transport".to_string(), "tcp".to_string()]
        } else {
            Vec::new()
        }
    }

    /// Builds ffmpeg arguments for one capture attempt.
    fn build_capture_args(&self, job: &CaptureJob) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-loglevel".to_string(),
            self.config.log_level.clone(),
        ];

        match &job.input {
            CaptureInput::Live(url) => {
                args.extend(Self::input_args(url));
                args.extend(["-i".to_string(), url.clone()]);
            }
            CaptureInput::File(path) => {
                // Replay at native frame rate
                args.extend([
                    "-re".to_string(),
                    "-i".to_string(),
                    path.to_string_lossy().to_string(),
                ]);
            }
        }

        args.extend(["-map".to_string(), "0".to_string(), "-c".to_string(), "copy".to_string()]);

        match (&job.output, &job.push_url) {
            (Some(_), Some(push)) => {
                // Record to stdout and push to the ingest; a failing push
                // must not take the recording down with it.
                args.extend([
                    "-f".to_string(),
                    "tee".to_string(),
                    format!("[f=mpegts]pipe\\:1|[f=flv:onfail=ignore]{}", push),
                ]);
            }
            (Some(_), None) => {
                args.extend(["-f".to_string(), "mpegts".to_string(), "pipe:1".to_string()]);
            }
            (None, Some(push)) => {
                args.extend(["-f".to_string(), "flv".to_string(), push.clone()]);
            }
            (None, None) => {
                args.extend(["-f".to_string(), "null".to_string(), "-".to_string()]);
            }
        }

        args
    }

    /// Builds ffmpeg arguments for a VOD transcode.
    ///
    /// Presentation sources are mostly static slides and get a lower CRF
    /// with the still-image tune; camera footage compresses harder.
    fn build_transcode_args(&self, job: &TranscodeJob) -> Vec<String> {
        let (crf, tune) = match job.variant {
            SourceVariant::Camera => ("26", None),
            SourceVariant::Presentation => ("22", Some("stillimage")),
            SourceVariant::Combined => ("24", None),
        };

        let mut args = vec![
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-loglevel".to_string(),
            self.config.log_level.clone(),
            "-y".to_string(),
            "-i".to_string(),
            job.input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.config.preset.clone(),
            "-crf".to_string(),
            crf.to_string(),
        ];
        if let Some(tune) = tune {
            args.extend(["-tune".to_string(), tune.to_string()]);
        }
        args.extend([
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "128k".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            job.output.to_string_lossy().to_string(),
        ]);
        args
    }

    /// Command for a transcode, wrapped in `nice` unless niceness is 0.
    fn transcode_command(&self, args: &[String]) -> Command {
        let mut cmd = if self.config.niceness != 0 {
            let mut cmd = Command::new("nice");
            cmd.arg("-n")
                .arg(self.config.niceness.to_string())
                .arg(&self.config.ffmpeg_path);
            cmd
        } else {
            Command::new(&self.config.ffmpeg_path)
        };
        cmd.args(args);
        cmd
    }

    fn parse_probe_duration(output: &str) -> Result<f64, EncoderError> {
        #[derive(Deserialize)]
        struct ProbeOutput {
            format: ProbeFormat,
        }

        #[derive(Deserialize)]
        struct ProbeFormat {
            duration: Option<String>,
        }

        let probe: ProbeOutput =
            serde_json::from_str(output).map_err(|e| EncoderError::ProbeFailed {
                reason: format!("invalid ffprobe output: {}", e),
            })?;

        probe
            .format
            .duration
            .and_then(|d| d.parse::<f64>().ok())
            .ok_or_else(|| EncoderError::ProbeFailed {
                reason: "ffprobe reported no duration".to_string(),
            })
    }

    /// Run ffmpeg with piped output and fail on a non-zero exit.
    async fn run_ffmpeg(&self, args: &[String], timeout: Duration) -> Result<Output, EncoderError> {
        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(args = ?args, "Running ffmpeg");

        let child = GroupChild::spawn(&mut cmd, &self.ffmpeg_program())?;
        let output = child.output(timeout).await?;
        if !output.status.success() {
            return Err(EncoderError::process_failed(
                self.ffmpeg_program(),
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(output)
    }
}

/// Drain a stderr pipe, keeping the last lines.
async fn collect_tail<R: AsyncRead + Unpin>(stderr: R) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(line = %line, "ffmpeg");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn capture(
        &self,
        job: &CaptureJob,
        cancel: &CancellationToken,
    ) -> Result<CaptureExit, EncoderError> {
        let remaining = (job.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return Ok(CaptureExit::DeadlineReached);
        }

        // Open the raw file first so a bad path never starts a process
        let file = match &job.output {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?,
            ),
            None => None,
        };

        let args = self.build_capture_args(job);
        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(if file.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped());

        let mut child = GroupChild::spawn(&mut cmd, &self.ffmpeg_program())?;

        let copy_task = match (child.child_mut().stdout.take(), file) {
            (Some(mut stdout), Some(mut file)) => Some(tokio::spawn(async move {
                tokio::io::copy(&mut stdout, &mut file).await
            })),
            _ => None,
        };
        let stderr_task = child
            .child_mut()
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_tail(stderr)));

        let outcome = child.wait(cancel, Some(remaining)).await?;

        if let Some(task) = copy_task {
            match task.await {
                Ok(Ok(bytes)) => debug!(bytes, "Capture attempt wrote bytes"),
                Ok(Err(e)) => return Err(EncoderError::Io(e)),
                Err(e) => debug!(error = %e, "Capture copy task aborted"),
            }
        }
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        match outcome {
            WaitOutcome::Exited(status) if status.success() => Ok(CaptureExit::Ended),
            WaitOutcome::Exited(status) => Err(EncoderError::process_failed(
                self.ffmpeg_program(),
                status.code(),
                &stderr,
            )),
            WaitOutcome::Cancelled => Ok(CaptureExit::Cancelled),
            WaitOutcome::TimedOut => Ok(CaptureExit::DeadlineReached),
        }
    }

    async fn transcode(&self, job: &TranscodeJob) -> Result<(), EncoderError> {
        let args = self.build_transcode_args(job);
        let mut cmd = self.transcode_command(&args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        info!(
            input = %job.input.display(),
            output = %job.output.display(),
            variant = %job.variant,
            niceness = self.config.niceness,
            "Starting transcode"
        );

        let child = GroupChild::spawn(&mut cmd, &self.ffmpeg_program())?;
        let output = child
            .output(Duration::from_secs(self.config.transcode_timeout_secs))
            .await?;

        if !output.status.success() {
            return Err(EncoderError::process_failed(
                self.ffmpeg_program(),
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        if !tokio::fs::try_exists(&job.output).await.unwrap_or(false) {
            return Err(EncoderError::MissingOutput {
                path: job.output.clone(),
            });
        }
        Ok(())
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64, EncoderError> {
        let output = Command::new(&self.config.ffprobe_path)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
            .arg(path)
            .output()
            .await
            .map_err(|e| EncoderError::Spawn {
                program: self.config.ffprobe_path.to_string_lossy().to_string(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(EncoderError::ProbeFailed {
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Self::parse_probe_duration(&String::from_utf8_lossy(&output.stdout))
    }

    async fn detect_silence(
        &self,
        path: &Path,
        noise_db: f64,
        min_duration_secs: f64,
    ) -> Result<String, EncoderError> {
        // silencedetect logs at info level, so no -loglevel here
        let args = vec![
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-i".to_string(),
            path.to_string_lossy().to_string(),
            "-vn".to_string(),
            "-af".to_string(),
            format!("silencedetect=n={}dB:d={}", noise_db, min_duration_secs),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let output = self
            .run_ffmpeg(&args, Duration::from_secs(self.config.transcode_timeout_secs))
            .await?;
        Ok(String::from_utf8_lossy(&output.stderr).to_string())
    }

    async fn thumbnails(
        &self,
        input: &Path,
        sprite: &Path,
        poster: &Path,
    ) -> Result<(), EncoderError> {
        let duration = self.probe_duration(input).await?;
        let interval = (duration / SPRITE_FRAMES).max(1.0);

        let sprite_args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vf".to_string(),
            format!("fps=1/{:.3},scale=160:-1,tile=10x10", interval),
            "-frames:v".to_string(),
            "1".to_string(),
            "-q:v".to_string(),
            "5".to_string(),
            sprite.to_string_lossy().to_string(),
        ];
        self.run_ffmpeg(&sprite_args, self.job_timeout()).await?;

        let poster_args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-ss".to_string(),
            format!("{:.3}", duration * 0.1),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-vf".to_string(),
            "scale=640:-1".to_string(),
            poster.to_string_lossy().to_string(),
        ];
        self.run_ffmpeg(&poster_args, self.job_timeout()).await?;
        Ok(())
    }

    async fn live_preview(&self, source_url: &str) -> Result<Vec<u8>, EncoderError> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
        ];
        args.extend(Self::input_args(source_url));
        args.extend([
            "-i".to_string(),
            source_url.to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "image2".to_string(),
            "-c:v".to_string(),
            "mjpeg".to_string(),
            "pipe:1".to_string(),
        ]);
        let output = self.run_ffmpeg(&args, self.job_timeout()).await?;
        if output.stdout.is_empty() {
            return Err(EncoderError::process_failed(
                self.ffmpeg_program(),
                output.status.code(),
                "no frame captured",
            ));
        }
        Ok(output.stdout)
    }

    async fn section_image(
        &self,
        input: &Path,
        at_secs: u32,
        output: &Path,
    ) -> Result<(), EncoderError> {
        let args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-ss".to_string(),
            at_secs.to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-vf".to_string(),
            "scale=480:-1".to_string(),
            "-q:v".to_string(),
            "3".to_string(),
            output.to_string_lossy().to_string(),
        ];
        self.run_ffmpeg(&args, self.job_timeout()).await?;
        Ok(())
    }

    async fn waveform(&self, input: &Path) -> Result<Vec<u8>, EncoderError> {
        let args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-filter_complex".to_string(),
            "aformat=channel_layouts=mono,showwavespic=s=1000x100:colors=white".to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "image2".to_string(),
            "-c:v".to_string(),
            "png".to_string(),
            "pipe:1".to_string(),
        ];
        let output = self.run_ffmpeg(&args, self.job_timeout()).await?;
        Ok(output.stdout)
    }
}

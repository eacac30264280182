//! Worker role: captures, transcodes and publishes lecture streams.

mod backoff;
mod config;
mod encoder;
mod ffmpeg;
mod jobs;
mod pipeline;
mod process;
mod publish;
mod types;

pub use backoff::BackoffPolicy;
pub use config::{EncoderConfig, SilenceConfig, WorkerConfig};
pub use encoder::{CaptureExit, CaptureInput, CaptureJob, Encoder, EncoderError, TranscodeJob};
pub use ffmpeg::FfmpegEncoder;
pub use pipeline::{AssignmentInfo, PipelineEngine};
pub use publish::{HttpPublisher, PublishError, PublishRequest, PublishedVod, Publisher};
pub use types::{AssignmentKey, PipelineError, PipelineOutcome, Stage};

//! Worker configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the worker role (`[worker]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identity token shared with the coordinator. Required.
    pub id: String,

    /// Base URL under which the coordinator reaches this worker.
    #[serde(default = "default_address")]
    pub address: String,

    /// Coordinator base URL. Required.
    pub coordinator_url: String,

    /// Tenant this worker belongs to.
    #[serde(default)]
    pub tenant: Option<String>,

    /// Whether the worker takes streams of any tenant.
    #[serde(default)]
    pub shared: bool,

    /// Version string reported in heartbeats.
    #[serde(default = "default_version")]
    pub version: String,

    /// Where raw captures are written.
    #[serde(default = "default_recording_dir")]
    pub recording_dir: PathBuf,

    /// Where transcoded VOD files and images are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Raw files are moved here before their deletion is scheduled.
    #[serde(default = "default_trash_dir")]
    pub trash_dir: PathBuf,

    /// Backing file of the deletion queue.
    #[serde(default = "default_deletion_queue_file")]
    pub deletion_queue_file: PathBuf,

    /// Minimum age before a queued file is deleted (hours).
    #[serde(default = "default_retention_hours")]
    pub deletion_retention_hours: i64,

    /// How often the deletion queue is swept (seconds).
    #[serde(default = "default_sweep_interval")]
    pub deletion_sweep_interval_secs: u64,

    /// Periodic heartbeat interval (seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Host stats sampling interval (seconds).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Deadline for calls to the coordinator (seconds).
    #[serde(default = "default_rpc_deadline")]
    pub rpc_deadline_secs: u64,

    /// Capture keeps retrying until stream end plus this pad (seconds).
    #[serde(default = "default_capture_pad")]
    pub capture_pad_secs: i64,

    /// Minimum delay between capture attempts (seconds, at least 1).
    #[serde(default = "default_backoff_min")]
    pub capture_backoff_min_secs: u64,

    /// Maximum delay between capture attempts (seconds).
    #[serde(default = "default_backoff_max")]
    pub capture_backoff_max_secs: u64,

    /// Base URL of live playlists; the slot name is appended.
    #[serde(default)]
    pub live_playback_base: Option<String>,

    /// VOD upload endpoint. Publishing is skipped when unset.
    #[serde(default)]
    pub publish_url: Option<String>,

    /// Bearer token for the VOD upload endpoint.
    #[serde(default)]
    pub publish_token: Option<String>,

    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub silence: SilenceConfig,
}

fn default_address() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_recording_dir() -> PathBuf {
    PathBuf::from("/srv/castfleet/recordings")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/srv/castfleet/vod")
}

fn default_trash_dir() -> PathBuf {
    PathBuf::from("/srv/castfleet/trash")
}

fn default_deletion_queue_file() -> PathBuf {
    PathBuf::from("/srv/castfleet/deletion-queue.json")
}

fn default_retention_hours() -> i64 {
    24
}

fn default_sweep_interval() -> u64 {
    3600 // 1 hour
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_stats_interval() -> u64 {
    30
}

fn default_rpc_deadline() -> u64 {
    5
}

fn default_capture_pad() -> i64 {
    600 // 10 minutes
}

fn default_backoff_min() -> u64 {
    1
}

fn default_backoff_max() -> u64 {
    30
}

impl WorkerConfig {
    /// Minimal config with the given identity and coordinator URL.
    pub fn new(id: impl Into<String>, coordinator_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: default_address(),
            coordinator_url: coordinator_url.into(),
            tenant: None,
            shared: false,
            version: default_version(),
            recording_dir: default_recording_dir(),
            output_dir: default_output_dir(),
            trash_dir: default_trash_dir(),
            deletion_queue_file: default_deletion_queue_file(),
            deletion_retention_hours: default_retention_hours(),
            deletion_sweep_interval_secs: default_sweep_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            stats_interval_secs: default_stats_interval(),
            rpc_deadline_secs: default_rpc_deadline(),
            capture_pad_secs: default_capture_pad(),
            capture_backoff_min_secs: default_backoff_min(),
            capture_backoff_max_secs: default_backoff_max(),
            live_playback_base: None,
            publish_url: None,
            publish_token: None,
            encoder: EncoderConfig::default(),
            silence: SilenceConfig::default(),
        }
    }

    /// Place all storage directories under `root`.
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.recording_dir = root.join("recordings");
        self.output_dir = root.join("vod");
        self.trash_dir = root.join("trash");
        self.deletion_queue_file = root.join("deletion-queue.json");
        self
    }

    pub fn with_capture_pad(mut self, secs: i64) -> Self {
        self.capture_pad_secs = secs;
        self
    }

    pub fn with_live_playback_base(mut self, base: impl Into<String>) -> Self {
        self.live_playback_base = Some(base.into());
        self
    }
}

/// FFmpeg invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,

    /// Niceness for transcodes. 0 runs ffmpeg without the `nice` wrapper.
    #[serde(default = "default_niceness")]
    pub niceness: i32,

    /// x264 preset used for VOD transcodes.
    #[serde(default = "default_preset")]
    pub preset: String,

    /// FFmpeg log level for capture and transcode.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Timeout for one transcode (seconds).
    #[serde(default = "default_transcode_timeout")]
    pub transcode_timeout_secs: u64,

    /// Timeout for short jobs such as previews and images (seconds).
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_niceness() -> i32 {
    10
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_log_level() -> String {
    "error".to_string()
}

fn default_transcode_timeout() -> u64 {
    6 * 3600
}

fn default_job_timeout() -> u64 {
    120
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            niceness: default_niceness(),
            preset: default_preset(),
            log_level: default_log_level(),
            transcode_timeout_secs: default_transcode_timeout(),
            job_timeout_secs: default_job_timeout(),
        }
    }
}

/// Silence analysis thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilenceConfig {
    /// Noise floor in dB below which audio counts as silent.
    #[serde(default = "default_noise_db")]
    pub noise_db: f64,

    /// Minimum silence length reported by the analyzer (seconds).
    #[serde(default = "default_min_duration")]
    pub min_duration_secs: f64,

    /// A first interval starting before this is extended to 0 (seconds).
    #[serde(default = "default_clip_start")]
    pub clip_start_secs: f64,

    /// Intervals closer than this are merged (seconds).
    #[serde(default = "default_merge_gap")]
    pub merge_gap_secs: f64,
}

fn default_noise_db() -> f64 {
    -15.0
}

fn default_min_duration() -> f64 {
    30.0
}

fn default_clip_start() -> f64 {
    30.0
}

fn default_merge_gap() -> f64 {
    30.0
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            noise_db: default_noise_db(),
            min_duration_secs: default_min_duration(),
            clip_start_secs: default_clip_start(),
            merge_gap_secs: default_merge_gap(),
        }
    }
}

impl SilenceConfig {
    pub fn rules(&self) -> crate::silence::SilenceRules {
        crate::silence::SilenceRules {
            clip_start_secs: self.clip_start_secs,
            merge_gap_secs: self.merge_gap_secs,
        }
    }
}

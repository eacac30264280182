//! Per-assignment stage machine.
//!
//! Each assignment runs in its own task:
//! - CAPTURE: record the source (and push it live) until the end of the
//!   stream plus a pad, restarting the encoder whenever it exits early
//! - TRANSCODE: compress the raw recording to a VOD file
//! - PUBLISH: upload the VOD (when requested and configured)
//! - SILENCE_ANALYZE: combined source only
//! - MARK_FOR_DELETION: move the raw recording to the trash
//!
//! Every stage reports its outcome to the coordinator. A failed stage stops
//! the stages that depend on it and never undoes the ones before it.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::config::WorkerConfig;
use super::encoder::{CaptureExit, CaptureInput, CaptureJob, Encoder, EncoderError, TranscodeJob};
use super::publish::{PublishRequest, Publisher};
use super::types::{AssignmentKey, PipelineError, PipelineOutcome, Stage};
use crate::deletion::DeletionQueue;
use crate::metrics;
use crate::rpc::{
    AssignPremiereRequest, AssignStreamRequest, CancelStreamRequest, CoordinatorClient,
    PublishFinishedRequest, SilenceResultsRequest, StageFailedRequest, StreamFinishedRequest,
    StreamStartedRequest, TranscodingFinishedRequest, WorkerStatus,
};
use crate::silence;
use crate::status::StatusReporter;
use crate::streams::SourceVariant;

/// A capture attempt that ran at least this long resets the backoff.
const STABLE_CAPTURE: Duration = Duration::from_secs(60);

/// An assignment currently held by this worker.
#[derive(Debug, Clone)]
struct ActiveAssignment {
    slot_name: String,
    cancel: CancellationToken,
    discard: Arc<AtomicBool>,
}

/// Summary of a running assignment, for status output and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentInfo {
    pub key: AssignmentKey,
    pub slot_name: String,
    pub cancelled: bool,
}

/// Everything one stream assignment needs once its task is running.
#[derive(Debug, Clone)]
struct StreamJob {
    key: AssignmentKey,
    course_slug: String,
    stream_name: String,
    source_url: String,
    slot_name: String,
    push_url: Option<String>,
    publish_live: bool,
    publish_vod: bool,
    deadline: chrono::DateTime<Utc>,
}

/// Runs stream assignments and ad-hoc jobs on a worker.
pub struct PipelineEngine {
    pub(super) config: WorkerConfig,
    pub(super) encoder: Arc<dyn Encoder>,
    publisher: Option<Arc<dyn Publisher>>,
    coordinator: Arc<dyn CoordinatorClient>,
    pub(super) status: Arc<StatusReporter>,
    pub(super) deletion: Arc<DeletionQueue>,
    backoff: BackoffPolicy,

    // Runtime state
    active: RwLock<HashMap<AssignmentKey, ActiveAssignment>>,
    draining: AtomicBool,
    tasks: TaskTracker,
}

impl PipelineEngine {
    pub fn new(
        config: WorkerConfig,
        encoder: Arc<dyn Encoder>,
        publisher: Option<Arc<dyn Publisher>>,
        coordinator: Arc<dyn CoordinatorClient>,
        status: Arc<StatusReporter>,
        deletion: Arc<DeletionQueue>,
    ) -> Self {
        let backoff = BackoffPolicy::new(
            Duration::from_secs(config.capture_backoff_min_secs),
            Duration::from_secs(config.capture_backoff_max_secs),
        );
        Self {
            config,
            encoder,
            publisher,
            coordinator,
            status,
            deletion,
            backoff,
            active: RwLock::new(HashMap::new()),
            draining: AtomicBool::new(false),
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn status_reporter(&self) -> &Arc<StatusReporter> {
        &self.status
    }

    pub(super) fn check_identity(&self, worker_id: &str) -> Result<(), PipelineError> {
        if worker_id != self.config.id {
            warn!(received = %worker_id, "Rejecting request addressed to another worker");
            return Err(PipelineError::IdentityMismatch);
        }
        Ok(())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Stop taking work and cancel every running capture.
    ///
    /// Cancelled captures kill their process groups. Their pipelines carry
    /// on with whatever was recorded.
    pub async fn drain(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let active = self.active.read().await;
        info!(active = active.len(), "Draining pipeline engine");
        for (key, assignment) in active.iter() {
            debug!(assignment = %key, "Cancelling for shutdown");
            assignment.cancel.cancel();
        }
    }

    /// Wait until every spawned assignment and job task has finished.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    pub async fn active_assignments(&self) -> Vec<AssignmentInfo> {
        let active = self.active.read().await;
        let mut list: Vec<AssignmentInfo> = active
            .iter()
            .map(|(key, a)| AssignmentInfo {
                key: *key,
                slot_name: a.slot_name.clone(),
                cancelled: a.cancel.is_cancelled(),
            })
            .collect();
        list.sort_by_key(|a| (a.key.stream_id, a.key.variant.as_str()));
        list
    }

    /// Current status as served on the worker status endpoint.
    pub fn status(&self) -> WorkerStatus {
        let snapshot = self.status.snapshot();
        let identity = self.status.identity();
        WorkerStatus {
            worker_id: identity.id.clone(),
            workload: snapshot.workload,
            jobs: snapshot.jobs,
            stats: snapshot.stats,
            version: identity.version.clone(),
            draining: self.is_draining(),
        }
    }

    // ---------------------------------------------------------------------
    // Assignment intake
    // ---------------------------------------------------------------------

    /// Accept a stream assignment and start its pipeline in the background.
    ///
    /// Returns once the assignment is registered; the pipeline outcome is
    /// reported through coordinator notifications.
    pub async fn assign_stream(
        self: &Arc<Self>,
        req: AssignStreamRequest,
    ) -> Result<(), PipelineError> {
        self.check_identity(&req.worker_id)?;
        if self.is_draining() {
            return Err(PipelineError::Draining);
        }
        if req.source_url.trim().is_empty() {
            return Err(PipelineError::Malformed("source_url is empty".to_string()));
        }
        if req.slot_name.trim().is_empty() {
            return Err(PipelineError::Malformed("slot_name is empty".to_string()));
        }
        if req.course_slug.trim().is_empty() {
            return Err(PipelineError::Malformed("course_slug is empty".to_string()));
        }
        if req.end <= req.start {
            return Err(PipelineError::Malformed(format!(
                "stream ends ({}) before it starts ({})",
                req.end, req.start
            )));
        }

        let key = AssignmentKey {
            stream_id: req.stream_id,
            variant: req.source_type,
        };
        let push_url = if req.publish_live {
            Some(join_url(&req.ingest_server, &req.slot_name))
        } else {
            None
        };
        let job = StreamJob {
            key,
            course_slug: req.course_slug,
            stream_name: req.stream_name,
            source_url: req.source_url,
            slot_name: req.slot_name,
            push_url,
            publish_live: req.publish_live,
            publish_vod: req.publish_vod,
            deadline: req.end + chrono::Duration::seconds(self.config.capture_pad_secs),
        };

        let assignment = self.register_assignment(key, &job.slot_name).await?;
        info!(
            assignment = %key,
            slot = %job.slot_name,
            deadline = %job.deadline,
            "Accepted stream assignment"
        );

        let engine = Arc::clone(self);
        self.tasks.spawn(async move {
            let outcome = engine.run_stream(&job, &assignment).await;
            info!(assignment = %job.key, ?outcome, "Pipeline finished");
            engine.unregister_assignment(&job.key).await;
        });
        Ok(())
    }

    /// Accept a premiere: replay `file_path` to the ingest slot until `end`.
    pub async fn assign_premiere(
        self: &Arc<Self>,
        req: AssignPremiereRequest,
    ) -> Result<(), PipelineError> {
        self.check_identity(&req.worker_id)?;
        if self.is_draining() {
            return Err(PipelineError::Draining);
        }
        if req.slot_name.trim().is_empty() {
            return Err(PipelineError::Malformed("slot_name is empty".to_string()));
        }
        let file = PathBuf::from(&req.file_path);
        if !tokio::fs::try_exists(&file).await.unwrap_or(false) {
            return Err(PipelineError::Malformed(format!(
                "premiere file not found: {}",
                req.file_path
            )));
        }

        let key = AssignmentKey {
            stream_id: req.stream_id,
            variant: SourceVariant::Combined,
        };
        let assignment = self.register_assignment(key, &req.slot_name).await?;
        info!(assignment = %key, slot = %req.slot_name, file = %file.display(), "Accepted premiere");

        let engine = Arc::clone(self);
        self.tasks.spawn(async move {
            engine.run_premiere(&req, file, &assignment).await;
            engine.unregister_assignment(&key).await;
        });
        Ok(())
    }

    /// Cancel running assignments of a stream.
    ///
    /// Returns how many assignments were cancelled by this call. Cancelling
    /// an already cancelled or unknown assignment is a no-op.
    pub async fn cancel_stream(&self, req: &CancelStreamRequest) -> Result<usize, PipelineError> {
        self.check_identity(&req.worker_id)?;

        let active = self.active.read().await;
        let mut cancelled = 0;
        for (key, assignment) in active.iter() {
            if key.stream_id != req.stream_id {
                continue;
            }
            if let Some(ref slot) = req.slot_name {
                if &assignment.slot_name != slot {
                    continue;
                }
            }
            if assignment.cancel.is_cancelled() {
                continue;
            }
            if req.discard {
                assignment.discard.store(true, Ordering::SeqCst);
            }
            assignment.cancel.cancel();
            info!(assignment = %key, discard = req.discard, "Cancelled assignment");
            cancelled += 1;
        }

        if cancelled == 0 {
            debug!(stream_id = req.stream_id, "Nothing to cancel");
        }
        Ok(cancelled)
    }

    async fn register_assignment(
        &self,
        key: AssignmentKey,
        slot_name: &str,
    ) -> Result<ActiveAssignment, PipelineError> {
        let mut active = self.active.write().await;
        if active.contains_key(&key) {
            return Err(PipelineError::AlreadyAssigned {
                stream_id: key.stream_id,
                variant: key.variant,
            });
        }
        let assignment = ActiveAssignment {
            slot_name: slot_name.to_string(),
            cancel: CancellationToken::new(),
            discard: Arc::new(AtomicBool::new(false)),
        };
        active.insert(key, assignment.clone());
        metrics::ACTIVE_ASSIGNMENTS.inc();
        Ok(assignment)
    }

    async fn unregister_assignment(&self, key: &AssignmentKey) {
        if self.active.write().await.remove(key).is_some() {
            metrics::ACTIVE_ASSIGNMENTS.dec();
        }
    }

    // ---------------------------------------------------------------------
    // Stage machine
    // ---------------------------------------------------------------------

    async fn run_stream(&self, job: &StreamJob, assignment: &ActiveAssignment) -> PipelineOutcome {
        let key = job.key;
        let stem = file_stem(&job.stream_name, key.variant);
        let stream_dir = PathBuf::from(&job.course_slug).join(key.stream_id.to_string());
        let raw = self
            .config
            .recording_dir
            .join(&stream_dir)
            .join(format!("{}.ts", stem));
        let vod = self
            .config
            .output_dir
            .join(&stream_dir)
            .join(format!("{}.mp4", stem));

        // CAPTURE
        if let Some(parent) = raw.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(assignment = %key, error = %e, "Cannot create recording directory");
                self.report_failure(key, Stage::Capture, &e.to_string()).await;
                return PipelineOutcome::Aborted(Stage::Capture);
            }
        }

        let live_url = if job.publish_live {
            self.config
                .live_playback_base
                .as_deref()
                .map(|base| join_url(base, &job.slot_name))
        } else {
            None
        };
        self.notify(
            "stream_started",
            self.coordinator.stream_started(&StreamStartedRequest {
                worker_id: self.config.id.clone(),
                stream_id: key.stream_id,
                source_type: key.variant,
                slot_name: job.slot_name.clone(),
                live_url,
                premiere: false,
            }),
        )
        .await;

        let capture = CaptureJob {
            input: CaptureInput::Live(job.source_url.clone()),
            output: Some(raw.clone()),
            push_url: job.push_url.clone(),
            deadline: job.deadline,
        };
        let exit = self
            .tracked(
                Stage::Capture,
                format!(
                    "capture {} stream {} ({})",
                    job.slot_name, key.stream_id, key.variant
                ),
                self.capture_loop(key, &capture, &assignment.cancel, true),
            )
            .await;
        info!(assignment = %key, ?exit, "Capture finished");

        self.notify(
            "stream_finished",
            self.coordinator.stream_finished(&StreamFinishedRequest {
                worker_id: self.config.id.clone(),
                stream_id: key.stream_id,
                source_type: key.variant,
                slot_name: job.slot_name.clone(),
                premiere: false,
            }),
        )
        .await;

        if assignment.discard.load(Ordering::SeqCst) {
            info!(assignment = %key, "Discarding recording");
            if tokio::fs::try_exists(&raw).await.unwrap_or(false) {
                if let Err(e) = self.deletion.move_to_trash(&raw, &self.config.trash_dir).await {
                    error!(assignment = %key, error = %e, "Failed to trash discarded recording");
                }
            }
            return PipelineOutcome::Discarded;
        }

        let captured = tokio::fs::metadata(&raw)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if captured == 0 {
            warn!(assignment = %key, "Nothing was captured");
            self.report_failure(key, Stage::Capture, "no data captured")
                .await;
            return PipelineOutcome::Aborted(Stage::Capture);
        }

        // TRANSCODE
        let duration = match self
            .tracked(
                Stage::Transcode,
                format!("transcode stream {} ({})", key.stream_id, key.variant),
                self.transcode(&raw, &vod, key.variant),
            )
            .await
        {
            Ok(duration) => duration,
            Err(e) => {
                error!(assignment = %key, error = %e, "Transcode failed");
                self.report_failure(key, Stage::Transcode, &e.to_string())
                    .await;
                return PipelineOutcome::Aborted(Stage::Transcode);
            }
        };
        self.notify(
            "transcoding_finished",
            self.coordinator
                .transcoding_finished(&TranscodingFinishedRequest {
                    worker_id: self.config.id.clone(),
                    stream_id: key.stream_id,
                    source_type: key.variant,
                    file_path: vod.to_string_lossy().to_string(),
                    duration_secs: duration,
                }),
        )
        .await;

        // PUBLISH
        if job.publish_vod {
            self.publish(key, &job.course_slug, &vod).await;
        }

        // SILENCE_ANALYZE
        if key.variant == SourceVariant::Combined {
            self.analyze_silence(key, &vod).await;
        }

        // MARK_FOR_DELETION
        if let Err(e) = self
            .tracked(
                Stage::MarkForDeletion,
                format!("trash stream {} ({})", key.stream_id, key.variant),
                self.deletion.move_to_trash(&raw, &self.config.trash_dir),
            )
            .await
        {
            error!(assignment = %key, error = %e, "Failed to mark recording for deletion");
            self.report_failure(key, Stage::MarkForDeletion, &e.to_string())
                .await;
            return PipelineOutcome::Aborted(Stage::MarkForDeletion);
        }

        PipelineOutcome::Completed
    }

    async fn run_premiere(
        &self,
        req: &AssignPremiereRequest,
        file: PathBuf,
        assignment: &ActiveAssignment,
    ) {
        let key = AssignmentKey {
            stream_id: req.stream_id,
            variant: SourceVariant::Combined,
        };
        let live_url = self
            .config
            .live_playback_base
            .as_deref()
            .map(|base| join_url(base, &req.slot_name));
        self.notify(
            "stream_started",
            self.coordinator.stream_started(&StreamStartedRequest {
                worker_id: self.config.id.clone(),
                stream_id: req.stream_id,
                source_type: key.variant,
                slot_name: req.slot_name.clone(),
                live_url,
                premiere: true,
            }),
        )
        .await;

        let capture = CaptureJob {
            input: CaptureInput::File(file),
            output: None,
            push_url: Some(join_url(&req.ingest_server, &req.slot_name)),
            deadline: req.end + chrono::Duration::seconds(self.config.capture_pad_secs),
        };
        let exit = self
            .tracked(
                Stage::Premiere,
                format!("premiere {} stream {}", req.slot_name, req.stream_id),
                self.capture_loop(key, &capture, &assignment.cancel, false),
            )
            .await;
        info!(assignment = %key, ?exit, "Premiere finished");

        self.notify(
            "stream_finished",
            self.coordinator.stream_finished(&StreamFinishedRequest {
                worker_id: self.config.id.clone(),
                stream_id: req.stream_id,
                source_type: key.variant,
                slot_name: req.slot_name.clone(),
                premiere: true,
            }),
        )
        .await;
    }

    /// Run capture attempts until cancellation or the deadline.
    ///
    /// Encoder failures are always retried. An encoder that exits on its
    /// own is restarted only when `restart_on_end` is set; a file replay
    /// ends for good.
    async fn capture_loop(
        &self,
        key: AssignmentKey,
        job: &CaptureJob,
        cancel: &CancellationToken,
        restart_on_end: bool,
    ) -> Result<CaptureExit, EncoderError> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(CaptureExit::Cancelled);
            }
            if Utc::now() >= job.deadline {
                return Ok(CaptureExit::DeadlineReached);
            }

            let started = Instant::now();
            match self.encoder.capture(job, cancel).await {
                Ok(CaptureExit::Ended) if !restart_on_end => return Ok(CaptureExit::Ended),
                Ok(CaptureExit::Ended) => {
                    warn!(assignment = %key, "Source ended before the deadline, restarting capture");
                }
                Ok(exit) => return Ok(exit),
                Err(e) => {
                    warn!(assignment = %key, attempt, error = %e, "Capture attempt failed");
                }
            }

            if started.elapsed() >= STABLE_CAPTURE {
                attempt = 0;
            }
            attempt += 1;
            metrics::CAPTURE_RETRIES.inc();
            if !self.backoff.wait(attempt, job.deadline, cancel).await {
                return Ok(if cancel.is_cancelled() {
                    CaptureExit::Cancelled
                } else {
                    CaptureExit::DeadlineReached
                });
            }
        }
    }

    async fn transcode(
        &self,
        raw: &Path,
        vod: &Path,
        variant: SourceVariant,
    ) -> Result<f64, EncoderError> {
        if let Some(parent) = vod.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.encoder
            .transcode(&TranscodeJob {
                input: raw.to_path_buf(),
                output: vod.to_path_buf(),
                variant,
            })
            .await?;
        self.encoder.probe_duration(vod).await
    }

    async fn publish(&self, key: AssignmentKey, course_slug: &str, vod: &Path) {
        let Some(ref publisher) = self.publisher else {
            debug!(assignment = %key, "No publish endpoint configured, skipping upload");
            return;
        };
        let request = PublishRequest {
            stream_id: key.stream_id,
            course_slug: course_slug.to_string(),
            variant: key.variant,
            file_path: vod.to_path_buf(),
        };
        match self
            .tracked(
                Stage::Publish,
                format!("publish stream {} ({})", key.stream_id, key.variant),
                publisher.publish(&request),
            )
            .await
        {
            Ok(published) => {
                info!(assignment = %key, vod_url = %published.vod_url, "Published VOD");
                self.notify(
                    "publish_finished",
                    self.coordinator.publish_finished(&PublishFinishedRequest {
                        worker_id: self.config.id.clone(),
                        stream_id: key.stream_id,
                        source_type: key.variant,
                        vod_url: published.vod_url,
                        thumbnail_url: published.thumbnail_url,
                    }),
                )
                .await;
            }
            Err(e) => {
                error!(assignment = %key, error = %e, "Publish failed");
                self.report_failure(key, Stage::Publish, &e.to_string()).await;
            }
        }
    }

    async fn analyze_silence(&self, key: AssignmentKey, vod: &Path) {
        let settings = &self.config.silence;
        let result = self
            .tracked(
                Stage::SilenceAnalyze,
                format!("silence detection stream {}", key.stream_id),
                async {
                    let output = self
                        .encoder
                        .detect_silence(vod, settings.noise_db, settings.min_duration_secs)
                        .await
                        .map_err(|e| PipelineError::encoder(Stage::SilenceAnalyze, e))?;
                    Ok::<_, PipelineError>(silence::analyze(&output, settings.rules())?)
                },
            )
            .await;

        match result {
            Ok(silences) => {
                info!(assignment = %key, intervals = silences.len(), "Silence analysis finished");
                let (starts, ends) = silence::split_bounds(&silences);
                self.notify(
                    "silence_results",
                    self.coordinator.silence_results(&SilenceResultsRequest {
                        worker_id: self.config.id.clone(),
                        stream_id: key.stream_id,
                        starts,
                        ends,
                    }),
                )
                .await;
            }
            Err(e) => {
                error!(assignment = %key, error = %e, "Silence analysis failed");
                self.report_failure(key, Stage::SilenceAnalyze, &e.to_string())
                    .await;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Bookkeeping
    // ---------------------------------------------------------------------

    /// Run `fut` as a job in the status ledger and record stage metrics.
    pub(super) async fn tracked<T, E, F>(
        &self,
        stage: Stage,
        description: String,
        fut: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let handle = self.status.begin_job(description, stage.cost()).await;
        let started = Instant::now();
        let result = fut.await;
        metrics::STAGE_DURATION
            .with_label_values(&[stage.as_str()])
            .observe(started.elapsed().as_secs_f64());
        let label = if result.is_ok() { "ok" } else { "failed" };
        metrics::STAGES
            .with_label_values(&[stage.as_str(), label])
            .inc();
        self.status.end_job(handle).await;
        result
    }

    async fn report_failure(&self, key: AssignmentKey, stage: Stage, error: &str) {
        self.notify(
            "stage_failed",
            self.coordinator.stage_failed(&StageFailedRequest {
                worker_id: self.config.id.clone(),
                stream_id: key.stream_id,
                source_type: key.variant,
                stage: stage.as_str().to_string(),
                error: error.to_string(),
            }),
        )
        .await;
    }

    /// Await a coordinator notification, logging failures.
    async fn notify<F>(&self, what: &str, fut: F)
    where
        F: Future<Output = Result<(), crate::rpc::RpcError>>,
    {
        if let Err(e) = fut.await {
            warn!(notification = what, error = %e, "Failed to notify coordinator");
        }
    }
}

/// File name stem for a stream source: the lecture name reduced to
/// `[A-Za-z0-9_-]`, followed by the variant.
pub(super) fn file_stem(stream_name: &str, variant: SourceVariant) -> String {
    let cleaned: String = stream_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        format!("stream_{}", variant)
    } else {
        format!("{}_{}", cleaned, variant)
    }
}

fn join_url(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcError;
    use crate::status::WorkerIdentity;
    use crate::testing::{fixtures, MockCoordinatorClient, MockEncoder, MockPublisher};
    use tempfile::TempDir;

    struct Harness {
        engine: Arc<PipelineEngine>,
        encoder: Arc<MockEncoder>,
        coordinator: Arc<MockCoordinatorClient>,
        deletion: Arc<DeletionQueue>,
        _dir: TempDir,
    }

    async fn harness(publisher: Option<Arc<MockPublisher>>) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = fixtures::worker_config("w1", dir.path());
        let encoder = Arc::new(MockEncoder::new());
        let coordinator = Arc::new(MockCoordinatorClient::new());
        let status = Arc::new(StatusReporter::new(
            WorkerIdentity {
                id: "w1".to_string(),
                address: "http://w1".to_string(),
                version: "test".to_string(),
                tenant: None,
                shared: true,
            },
            coordinator.clone(),
        ));
        let deletion = Arc::new(
            DeletionQueue::load(&config.deletion_queue_file, chrono::Duration::hours(24))
                .await
                .unwrap(),
        );
        let engine = Arc::new(PipelineEngine::new(
            config,
            encoder.clone(),
            publisher.map(|p| p as Arc<dyn Publisher>),
            coordinator.clone(),
            status,
            deletion.clone(),
        ));
        Harness {
            engine,
            encoder,
            coordinator,
            deletion,
            _dir: dir,
        }
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(
            file_stem("Einführung in die Informatik", SourceVariant::Camera),
            "Einf_hrung_in_die_Informatik_CAM"
        );
        assert_eq!(file_stem("  ", SourceVariant::Combined), "stream_COMB");
    }

    #[tokio::test]
    async fn test_identity_mismatch_starts_nothing() {
        let h = harness(None).await;
        let mut req = fixtures::assign_stream_request("w1", 1, SourceVariant::Combined);
        req.worker_id = "w2".to_string();

        let err = h.engine.assign_stream(req).await.unwrap_err();
        assert!(matches!(err, PipelineError::IdentityMismatch));
        assert!(h.engine.active_assignments().await.is_empty());
        assert_eq!(h.engine.status().workload, 0);
        assert!(h.encoder.captures().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_assignment_rejected() {
        let h = harness(None).await;
        let mut req = fixtures::assign_stream_request("w1", 1, SourceVariant::Camera);
        req.end = req.start;
        assert!(matches!(
            h.engine.assign_stream(req).await,
            Err(PipelineError::Malformed(_))
        ));

        let mut req = fixtures::assign_stream_request("w1", 1, SourceVariant::Camera);
        req.source_url = String::new();
        assert!(matches!(
            h.engine.assign_stream(req).await,
            Err(PipelineError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_assignment_rejected() {
        let h = harness(None).await;
        let req = fixtures::assign_stream_request("w1", 1, SourceVariant::Camera);
        h.engine.assign_stream(req.clone()).await.unwrap();
        assert!(matches!(
            h.engine.assign_stream(req).await,
            Err(PipelineError::AlreadyAssigned { stream_id: 1, .. })
        ));
        h.engine.drain().await;
        h.engine.wait_idle().await;
    }

    #[tokio::test]
    async fn test_combined_pipeline_notification_order() {
        let publisher = Arc::new(MockPublisher::new());
        let h = harness(Some(publisher.clone())).await;
        h.encoder
            .set_silence_output("silence_start: 10\nsilence_end: 20\nsilence_start: 35\nsilence_end: 90\n")
            .await;

        let mut req = fixtures::assign_stream_request("w1", 7, SourceVariant::Combined);
        req.end = Utc::now() + chrono::Duration::milliseconds(300);
        h.engine.assign_stream(req).await.unwrap();
        h.engine.wait_idle().await;

        assert_eq!(
            h.coordinator.notification_kinds().await,
            vec![
                "stream_started",
                "stream_finished",
                "transcoding_finished",
                "publish_finished",
                "silence_results"
            ]
        );
        let silences = h.coordinator.silence_results().await;
        assert_eq!(silences[0].starts, vec![0]);
        assert_eq!(silences[0].ends, vec![90]);
        assert_eq!(publisher.published().await.len(), 1);

        // Raw recording is in the trash and queued for deletion
        let pending = h.deletion.pending().await;
        assert_eq!(pending.len(), 1);
        assert!(pending[0].path.starts_with(&h.engine.config().trash_dir));
        assert!(h.engine.active_assignments().await.is_empty());
        assert_eq!(h.engine.status().workload, 0);
    }

    #[tokio::test]
    async fn test_camera_pipeline_skips_silence() {
        let h = harness(Some(Arc::new(MockPublisher::new()))).await;
        let mut req = fixtures::assign_stream_request("w1", 3, SourceVariant::Camera);
        req.end = Utc::now() + chrono::Duration::milliseconds(200);
        h.engine.assign_stream(req).await.unwrap();
        h.engine.wait_idle().await;

        let kinds = h.coordinator.notification_kinds().await;
        assert!(!kinds.contains(&"silence_results".to_string()));
        assert!(kinds.contains(&"publish_finished".to_string()));
        assert_eq!(h.encoder.transcodes().await[0].variant, SourceVariant::Camera);
    }

    #[tokio::test]
    async fn test_capture_failures_are_retried() {
        let h = harness(None).await;
        h.encoder.fail_next_captures(2).await;

        let mut req = fixtures::assign_stream_request("w1", 4, SourceVariant::Presentation);
        req.end = Utc::now() + chrono::Duration::seconds(6);
        h.engine.assign_stream(req).await.unwrap();
        h.engine.wait_idle().await;

        // Two failures then the successful attempt that ran to the deadline
        assert_eq!(h.encoder.captures().await.len(), 3);
        assert!(h
            .coordinator
            .notification_kinds()
            .await
            .contains(&"transcoding_finished".to_string()));
    }

    #[tokio::test]
    async fn test_transcode_failure_keeps_raw_and_reports() {
        let h = harness(None).await;
        h.encoder.fail_transcode(true).await;

        let mut req = fixtures::assign_stream_request("w1", 5, SourceVariant::Combined);
        req.end = Utc::now() + chrono::Duration::milliseconds(200);
        h.engine.assign_stream(req).await.unwrap();
        h.engine.wait_idle().await;

        let failures = h.coordinator.stage_failures().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].stage, "transcode");
        let kinds = h.coordinator.notification_kinds().await;
        assert!(!kinds.contains(&"silence_results".to_string()));
        assert!(h.deletion.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stop_pipeline() {
        let publisher = Arc::new(MockPublisher::new());
        publisher.set_fail(true).await;
        let h = harness(Some(publisher)).await;

        let mut req = fixtures::assign_stream_request("w1", 6, SourceVariant::Combined);
        req.end = Utc::now() + chrono::Duration::milliseconds(200);
        h.engine.assign_stream(req).await.unwrap();
        h.engine.wait_idle().await;

        let failures = h.coordinator.stage_failures().await;
        assert_eq!(failures[0].stage, "publish");
        assert!(h
            .coordinator
            .notification_kinds()
            .await
            .contains(&"silence_results".to_string()));
        assert_eq!(h.deletion.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let h = harness(None).await;
        let mut req = fixtures::assign_stream_request("w1", 8, SourceVariant::Camera);
        req.end = Utc::now() + chrono::Duration::hours(1);
        h.engine.assign_stream(req).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cancel = CancelStreamRequest {
            worker_id: "w1".to_string(),
            stream_id: 8,
            slot_name: None,
            discard: false,
        };
        assert_eq!(h.engine.cancel_stream(&cancel).await.unwrap(), 1);
        assert_eq!(h.engine.cancel_stream(&cancel).await.unwrap(), 0);
        h.engine.wait_idle().await;
        assert_eq!(h.engine.cancel_stream(&cancel).await.unwrap(), 0);

        // Cancelled without discard still transcodes what was recorded
        assert_eq!(h.encoder.transcodes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_with_discard_trashes_recording() {
        let h = harness(None).await;
        let mut req = fixtures::assign_stream_request("w1", 9, SourceVariant::Camera);
        req.end = Utc::now() + chrono::Duration::hours(1);
        h.engine.assign_stream(req).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cancel = CancelStreamRequest {
            worker_id: "w1".to_string(),
            stream_id: 9,
            slot_name: Some("slot-9".to_string()),
            discard: true,
        };
        assert_eq!(h.engine.cancel_stream(&cancel).await.unwrap(), 1);
        h.engine.wait_idle().await;

        assert!(h.encoder.transcodes().await.is_empty());
        assert_eq!(h.deletion.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_other_slot_is_noop() {
        let h = harness(None).await;
        let mut req = fixtures::assign_stream_request("w1", 10, SourceVariant::Camera);
        req.end = Utc::now() + chrono::Duration::hours(1);
        h.engine.assign_stream(req).await.unwrap();

        let cancel = CancelStreamRequest {
            worker_id: "w1".to_string(),
            stream_id: 10,
            slot_name: Some("another-slot".to_string()),
            discard: false,
        };
        assert_eq!(h.engine.cancel_stream(&cancel).await.unwrap(), 0);
        h.engine.drain().await;
        h.engine.wait_idle().await;
    }

    #[tokio::test]
    async fn test_drain_rejects_new_work() {
        let h = harness(None).await;
        h.engine.drain().await;
        let req = fixtures::assign_stream_request("w1", 11, SourceVariant::Camera);
        assert!(matches!(
            h.engine.assign_stream(req).await,
            Err(PipelineError::Draining)
        ));
        assert!(h.engine.status().draining);
    }

    #[tokio::test]
    async fn test_empty_capture_aborts() {
        let h = harness(None).await;
        h.encoder.set_capture_writes(false).await;

        let mut req = fixtures::assign_stream_request("w1", 12, SourceVariant::Camera);
        req.end = Utc::now() + chrono::Duration::milliseconds(200);
        h.engine.assign_stream(req).await.unwrap();
        h.engine.wait_idle().await;

        let failures = h.coordinator.stage_failures().await;
        assert_eq!(failures[0].stage, "capture");
        assert!(h.encoder.transcodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_premiere_replays_file() {
        let h = harness(None).await;
        let file = h.engine.config().output_dir.join("replay.mp4");
        tokio::fs::create_dir_all(file.parent().unwrap()).await.unwrap();
        tokio::fs::write(&file, b"vod").await.unwrap();

        let req = AssignPremiereRequest {
            worker_id: "w1".to_string(),
            stream_id: 20,
            course_slug: "eidi".to_string(),
            stream_name: "Replay".to_string(),
            file_path: file.to_string_lossy().to_string(),
            end: Utc::now() + chrono::Duration::milliseconds(200),
            slot_name: "slot-p".to_string(),
            ingest_server: "rtmp://ingest/live".to_string(),
        };
        h.engine.assign_premiere(req).await.unwrap();
        h.engine.wait_idle().await;

        let captures = h.encoder.captures().await;
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0].input, CaptureInput::File(file));
        assert!(captures[0].output.is_none());
        assert_eq!(
            captures[0].push_url.as_deref(),
            Some("rtmp://ingest/live/slot-p")
        );
        let started = h.coordinator.stream_started().await;
        assert!(started[0].premiere);
        assert!(h.encoder.transcodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_premiere_missing_file_rejected() {
        let h = harness(None).await;
        let req = AssignPremiereRequest {
            worker_id: "w1".to_string(),
            stream_id: 21,
            course_slug: "eidi".to_string(),
            stream_name: "Replay".to_string(),
            file_path: "/nonexistent/replay.mp4".to_string(),
            end: Utc::now(),
            slot_name: "slot-p".to_string(),
            ingest_server: "rtmp://ingest/live".to_string(),
        };
        assert!(matches!(
            h.engine.assign_premiere(req).await,
            Err(PipelineError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_notification_failures_do_not_abort() {
        let h = harness(None).await;
        h.coordinator
            .set_next_error(RpcError::Transport("down".to_string()))
            .await;
        let mut req = fixtures::assign_stream_request("w1", 13, SourceVariant::Camera);
        req.end = Utc::now() + chrono::Duration::milliseconds(200);
        h.engine.assign_stream(req).await.unwrap();
        h.engine.wait_idle().await;
        assert_eq!(h.deletion.pending().await.len(), 1);
    }
}

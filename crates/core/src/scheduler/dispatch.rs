//! Dispatch passes: bind due streams to ingest slots and workers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::config::CoordinatorConfig;
use super::types::{DispatchResult, PassReport, SchedulerError, StopReport};
use crate::metrics;
use crate::registry::{
    IngestSlot, IngestStore, SlotPreference, StoreError, Worker, WorkerStore,
};
use crate::rpc::{
    AssignPremiereRequest, AssignStreamRequest, CancelStreamRequest, DeleteSectionImageRequest,
    GenerateThumbnailsRequest, LivePreviewRequest, LivePreviewResponse, RpcError,
    SectionImagesRequest, SectionImagesResponse, ThumbnailsResponse, WaveformRequest,
    WaveformResponse, WorkerClient,
};
use crate::streams::{DuePremiere, DueStream, SourceVariant, StreamSource, StreamStore};
use crate::worker::Stage;

/// Workload taken back from a worker whose call failed.
const FAILURE_PENALTY: i64 = 1;

/// Pick the least loaded worker that serves `tenant`.
///
/// Ties go to the worker listed first.
pub fn select_worker(workers: &[Worker], tenant: Option<&str>) -> Option<usize> {
    workers
        .iter()
        .enumerate()
        .filter(|(_, w)| w.serves_tenant(tenant))
        .min_by_key(|(_, w)| w.workload)
        .map(|(idx, _)| idx)
}

/// Hands streams, premieres and ad-hoc jobs to workers.
///
/// Passes are serialized by one lock. Ad-hoc job placement takes the same
/// lock while it picks a worker, so workload reads and writes never
/// interleave with a pass.
pub struct Scheduler {
    config: CoordinatorConfig,
    workers: Arc<dyn WorkerStore>,
    slots: Arc<dyn IngestStore>,
    streams: Arc<dyn StreamStore>,
    client: Arc<dyn WorkerClient>,
    pass_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        config: CoordinatorConfig,
        workers: Arc<dyn WorkerStore>,
        slots: Arc<dyn IngestStore>,
        streams: Arc<dyn StreamStore>,
        client: Arc<dyn WorkerClient>,
    ) -> Self {
        Self {
            config,
            workers,
            slots,
            streams,
            client,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Workers seen within the liveness window, in registry order.
    pub fn alive_workers(&self, now: DateTime<Utc>) -> Result<Vec<Worker>, SchedulerError> {
        let window = self.config.liveness_window();
        Ok(self
            .workers
            .list()?
            .into_iter()
            .filter(|w| w.is_alive_at(now, window))
            .collect())
    }

    /// Run one dispatch pass.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport, SchedulerError> {
        let _guard = self.pass_lock.lock().await;

        let result = self.run_pass_locked(now).await;
        let label = match &result {
            Ok(report) if report.aborted => "aborted_no_workers",
            Ok(_) => "completed",
            Err(_) => "failed",
        };
        metrics::DISPATCH_PASSES.with_label_values(&[label]).inc();
        result
    }

    async fn run_pass_locked(&self, now: DateTime<Utc>) -> Result<PassReport, SchedulerError> {
        let lookahead = self.config.lookahead();
        let due = self.streams.due_streams(now, lookahead)?;
        let premieres = self.streams.due_premieres(now, lookahead)?;

        let mut report = PassReport {
            due_streams: due.len(),
            due_premieres: premieres.len(),
            ..Default::default()
        };
        if due.is_empty() && premieres.is_empty() {
            debug!("Nothing due");
            return Ok(report);
        }

        let mut workers = self.alive_workers(now)?;
        if workers.is_empty() {
            error!(
                due_streams = due.len(),
                due_premieres = premieres.len(),
                "No alive workers, aborting dispatch pass"
            );
            report.aborted = true;
            return Ok(report);
        }

        for stream in &due {
            for source in self.ordered_sources(stream) {
                let result = match self.dispatch_source(stream, source, &mut workers, now).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(stream_id = stream.stream_id, variant = %source.variant, error = %e, "Dispatch failed");
                        metrics::ASSIGNMENTS
                            .with_label_values(&["stream", "error"])
                            .inc();
                        continue;
                    }
                };
                report.record(&result);
            }
        }

        for premiere in &premieres {
            match self.dispatch_premiere(premiere, &mut workers, now).await {
                Ok(result) => report.record(&result),
                Err(e) => {
                    error!(stream_id = premiere.stream_id, error = %e, "Premiere dispatch failed");
                    metrics::ASSIGNMENTS
                        .with_label_values(&["premiere", "error"])
                        .inc();
                }
            }
        }

        info!(
            accepted = report.accepted,
            rejected = report.rejected,
            no_slot = report.skipped_no_slot,
            no_worker = report.skipped_no_worker,
            "Dispatch pass finished"
        );
        Ok(report)
    }

    /// Sources of `stream` that this coordinator dispatches, in configured order.
    fn ordered_sources<'a>(&self, stream: &'a DueStream) -> Vec<&'a StreamSource> {
        self.config
            .source_variants
            .iter()
            .flat_map(|variant| stream.sources.iter().filter(move |s| s.variant == *variant))
            .collect()
    }

    async fn dispatch_source(
        &self,
        stream: &DueStream,
        source: &StreamSource,
        workers: &mut [Worker],
        now: DateTime<Utc>,
    ) -> Result<DispatchResult, SchedulerError> {
        let Some(idx) = select_worker(workers, stream.tenant.as_deref()) else {
            warn!(
                stream_id = stream.stream_id,
                tenant = ?stream.tenant,
                "No alive worker serves this tenant"
            );
            metrics::STREAMS_SKIPPED
                .with_label_values(&["no_eligible_worker"])
                .inc();
            return Ok(DispatchResult::NoWorker);
        };

        let preference = match source.variant {
            SourceVariant::Combined => SlotPreference::PreferTranscoding,
            _ => SlotPreference::Plain,
        };
        let Some(slot) = self.slots.claim_slot(stream.stream_id, preference)? else {
            warn!(
                stream_id = stream.stream_id,
                variant = %source.variant,
                "No free ingest slot, skipping source"
            );
            metrics::STREAMS_SKIPPED.with_label_values(&["no_slot"]).inc();
            return Ok(DispatchResult::NoSlot);
        };

        let worker =
            self.reserve_or_release(&mut workers[idx], Stage::Capture.cost(), &slot, now)?;
        let request = AssignStreamRequest {
            worker_id: worker.id.clone(),
            stream_id: stream.stream_id,
            course_slug: stream.course_slug.clone(),
            stream_name: stream.name.clone(),
            source_type: source.variant,
            source_url: source.url.clone(),
            start: stream.start,
            end: stream.end,
            publish_live: stream.publish_live,
            publish_vod: stream.publish_vod,
            slot_name: slot.name.clone(),
            ingest_server: slot.server_url.clone(),
        };

        if let Err(e) = self.client.assign_stream(&worker.address, &request).await {
            return Ok(self
                .handle_failed_assignment("stream", &mut workers[idx], &slot, e, now)
                .await);
        }

        metrics::ASSIGNMENTS
            .with_label_values(&["stream", "accepted"])
            .inc();
        info!(
            stream_id = stream.stream_id,
            variant = %source.variant,
            worker_id = %worker.id,
            slot = %slot.name,
            "Stream source assigned"
        );
        if let Err(e) =
            self.streams
                .record_dispatch(stream.stream_id, source.variant, &worker.id, &slot.name)
        {
            return Ok(self
                .roll_back_unrecorded("stream", stream.stream_id, &mut workers[idx], &slot, e, now)
                .await);
        }
        Ok(DispatchResult::Accepted {
            worker_id: worker.id,
            slot_name: slot.name,
        })
    }

    async fn dispatch_premiere(
        &self,
        premiere: &DuePremiere,
        workers: &mut [Worker],
        now: DateTime<Utc>,
    ) -> Result<DispatchResult, SchedulerError> {
        let Some(idx) = select_worker(workers, premiere.tenant.as_deref()) else {
            warn!(stream_id = premiere.stream_id, "No alive worker for premiere");
            metrics::STREAMS_SKIPPED
                .with_label_values(&["no_eligible_worker"])
                .inc();
            return Ok(DispatchResult::NoWorker);
        };
        let Some(slot) = self
            .slots
            .claim_slot(premiere.stream_id, SlotPreference::Plain)?
        else {
            warn!(stream_id = premiere.stream_id, "No free ingest slot for premiere");
            metrics::STREAMS_SKIPPED.with_label_values(&["no_slot"]).inc();
            return Ok(DispatchResult::NoSlot);
        };

        let worker =
            self.reserve_or_release(&mut workers[idx], Stage::Premiere.cost(), &slot, now)?;
        let request = AssignPremiereRequest {
            worker_id: worker.id.clone(),
            stream_id: premiere.stream_id,
            course_slug: premiere.course_slug.clone(),
            stream_name: premiere.name.clone(),
            file_path: premiere.file_path.clone(),
            end: premiere.end,
            slot_name: slot.name.clone(),
            ingest_server: slot.server_url.clone(),
        };
        if let Err(e) = self.client.assign_premiere(&worker.address, &request).await {
            return Ok(self
                .handle_failed_assignment("premiere", &mut workers[idx], &slot, e, now)
                .await);
        }

        metrics::ASSIGNMENTS
            .with_label_values(&["premiere", "accepted"])
            .inc();
        info!(stream_id = premiere.stream_id, worker_id = %worker.id, slot = %slot.name, "Premiere assigned");
        if let Err(e) =
            self.streams
                .record_premiere_dispatch(premiere.stream_id, &worker.id, &slot.name)
        {
            return Ok(self
                .roll_back_unrecorded(
                    "premiere",
                    premiere.stream_id,
                    &mut workers[idx],
                    &slot,
                    e,
                    now,
                )
                .await);
        }
        Ok(DispatchResult::Accepted {
            worker_id: worker.id,
            slot_name: slot.name,
        })
    }

    /// Add `cost` to a worker's workload, in the registry and in the pass's
    /// local view, and return the updated worker.
    fn reserve(&self, worker: &mut Worker, cost: i64) -> Result<Worker, SchedulerError> {
        worker.workload = self.workers.adjust_workload(&worker.id, cost)?;
        debug!(worker_id = %worker.id, workload = worker.workload, "Reserved workload");
        Ok(worker.clone())
    }

    /// `reserve`, giving the claimed slot back if the reservation fails.
    fn reserve_or_release(
        &self,
        worker: &mut Worker,
        cost: i64,
        slot: &IngestSlot,
        now: DateTime<Utc>,
    ) -> Result<Worker, SchedulerError> {
        self.reserve(worker, cost).map_err(|err| {
            if let Err(e) = self.slots.release_slot(&slot.name, now) {
                error!(slot = %slot.name, error = %e, "Failed to release slot");
            }
            err
        })
    }

    /// Take `FAILURE_PENALTY` off a worker after a failed call.
    fn penalize(&self, worker_id: &str) -> Option<i64> {
        match self.workers.adjust_workload(worker_id, -FAILURE_PENALTY) {
            Ok(workload) => Some(workload),
            Err(e) => {
                warn!(worker_id, error = %e, "Failed to apply workload penalty");
                None
            }
        }
    }

    async fn handle_failed_assignment(
        &self,
        kind: &str,
        worker: &mut Worker,
        slot: &IngestSlot,
        error: RpcError,
        now: DateTime<Utc>,
    ) -> DispatchResult {
        warn!(
            worker_id = %worker.id,
            slot = %slot.name,
            kind,
            retryable = error.is_retryable(),
            error = %error,
            "Assignment failed"
        );
        metrics::ASSIGNMENTS
            .with_label_values(&[kind, error.outcome_label()])
            .inc();

        if let Some(workload) = self.penalize(&worker.id) {
            worker.workload = workload;
        }
        if let Err(e) = self.slots.release_slot(&slot.name, now) {
            error!(slot = %slot.name, error = %e, "Failed to release slot after failed assignment");
        }

        DispatchResult::Rejected {
            worker_id: worker.id.clone(),
            reason: match error {
                RpcError::Rejected(reason) => reason,
                other => other.to_string(),
            },
        }
    }

    /// Undo an accepted assignment whose dispatch could not be stored, so
    /// the next pass does not see the source as undispatched.
    async fn roll_back_unrecorded(
        &self,
        kind: &str,
        stream_id: i64,
        worker: &mut Worker,
        slot: &IngestSlot,
        error: StoreError,
        now: DateTime<Utc>,
    ) -> DispatchResult {
        error!(stream_id, worker_id = %worker.id, slot = %slot.name, kind, error = %error, "Failed to record dispatch, cancelling assignment");
        metrics::ASSIGNMENTS
            .with_label_values(&[kind, "unrecorded"])
            .inc();

        let request = CancelStreamRequest {
            worker_id: worker.id.clone(),
            stream_id,
            slot_name: Some(slot.name.clone()),
            discard: true,
        };
        match self.client.cancel_stream(&worker.address, &request).await {
            Ok(_) => {
                if let Err(e) = self.slots.release_slot(&slot.name, now) {
                    error!(slot = %slot.name, error = %e, "Failed to release slot after rollback");
                }
            }
            Err(e) => {
                // The worker may still be capturing; keep the slot bound so
                // it is reported as orphaned instead of handed out twice
                warn!(stream_id, worker_id = %worker.id, error = %e, "Rollback cancel failed");
            }
        }
        if let Some(workload) = self.penalize(&worker.id) {
            worker.workload = workload;
        }

        DispatchResult::Rejected {
            worker_id: worker.id.clone(),
            reason: format!("dispatch not recorded: {}", error),
        }
    }

    // ---------------------------------------------------------------------
    // Cancellation
    // ---------------------------------------------------------------------

    /// Cancel every running assignment of a stream.
    ///
    /// The worker holding a slot is the alive worker whose job list mentions
    /// the slot name.
    pub async fn stop_stream(
        &self,
        stream_id: i64,
        discard: bool,
    ) -> Result<StopReport, SchedulerError> {
        let stream = self
            .streams
            .get_stream(stream_id)?
            .ok_or(SchedulerError::StreamNotFound(stream_id))?;
        let workers = self.alive_workers(Utc::now())?;

        let mut report = StopReport::default();
        for slot in stream.slot_names() {
            let Some(worker) = workers.iter().find(|w| w.reports_job(&slot)) else {
                debug!(stream_id, slot = %slot, "No worker reports this slot");
                report.unmatched += 1;
                continue;
            };

            let request = CancelStreamRequest {
                worker_id: worker.id.clone(),
                stream_id,
                slot_name: Some(slot.clone()),
                discard,
            };
            match self.client.cancel_stream(&worker.address, &request).await {
                Ok(response) => {
                    info!(stream_id, slot = %slot, worker_id = %worker.id, cancelled = response.cancelled, "Stream stopped");
                    report.cancelled += response.cancelled;
                }
                Err(e) => {
                    warn!(stream_id, slot = %slot, worker_id = %worker.id, error = %e, "Cancel failed");
                    self.penalize(&worker.id);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Ad-hoc jobs
    // ---------------------------------------------------------------------

    /// Pick a worker for an ad-hoc job and reserve `cost` on it.
    async fn reserve_for_job(
        &self,
        tenant: Option<&str>,
        cost: i64,
    ) -> Result<Worker, SchedulerError> {
        let _guard = self.pass_lock.lock().await;
        let mut workers = self.alive_workers(Utc::now())?;
        let idx = select_worker(&workers, tenant).ok_or(SchedulerError::NoEligibleWorker)?;
        self.reserve(&mut workers[idx], cost)
    }

    fn stream_tenant(&self, stream_id: i64) -> Result<Option<String>, SchedulerError> {
        Ok(self
            .streams
            .get_stream(stream_id)?
            .ok_or(SchedulerError::StreamNotFound(stream_id))?
            .tenant)
    }

    fn job_outcome<T>(
        &self,
        kind: &str,
        worker: &Worker,
        result: Result<T, RpcError>,
    ) -> Result<T, SchedulerError> {
        match result {
            Ok(value) => {
                metrics::ASSIGNMENTS
                    .with_label_values(&[kind, "accepted"])
                    .inc();
                Ok(value)
            }
            Err(e) => {
                warn!(worker_id = %worker.id, kind, retryable = e.is_retryable(), error = %e, "Job failed");
                metrics::ASSIGNMENTS
                    .with_label_values(&[kind, e.outcome_label()])
                    .inc();
                self.penalize(&worker.id);
                Err(e.into())
            }
        }
    }

    pub async fn generate_thumbnails(
        &self,
        stream_id: i64,
        file_path: &str,
    ) -> Result<ThumbnailsResponse, SchedulerError> {
        let tenant = self.stream_tenant(stream_id)?;
        let worker = self
            .reserve_for_job(tenant.as_deref(), Stage::Thumbnails.cost())
            .await?;
        let request = GenerateThumbnailsRequest {
            worker_id: worker.id.clone(),
            stream_id,
            file_path: file_path.to_string(),
        };
        let result = self.client.generate_thumbnails(&worker.address, &request).await;
        self.job_outcome("thumbnails", &worker, result)
    }

    pub async fn live_preview(
        &self,
        source_url: &str,
        tenant: Option<&str>,
    ) -> Result<LivePreviewResponse, SchedulerError> {
        let worker = self
            .reserve_for_job(tenant, Stage::LivePreview.cost())
            .await?;
        let request = LivePreviewRequest {
            worker_id: worker.id.clone(),
            source_url: source_url.to_string(),
        };
        let result = self.client.live_preview(&worker.address, &request).await;
        self.job_outcome("live_preview", &worker, result)
    }

    pub async fn section_images(
        &self,
        stream_id: i64,
        file_path: &str,
        timestamps: Vec<u32>,
    ) -> Result<SectionImagesResponse, SchedulerError> {
        if timestamps.is_empty() {
            return Err(SchedulerError::Malformed("no timestamps given".to_string()));
        }
        let tenant = self.stream_tenant(stream_id)?;
        let worker = self
            .reserve_for_job(tenant.as_deref(), Stage::SectionImages.cost())
            .await?;
        let request = SectionImagesRequest {
            worker_id: worker.id.clone(),
            stream_id,
            file_path: file_path.to_string(),
            timestamps,
        };
        let result = self.client.section_images(&worker.address, &request).await;
        self.job_outcome("section_images", &worker, result)
    }

    pub async fn waveform(
        &self,
        stream_id: i64,
        file_path: &str,
    ) -> Result<WaveformResponse, SchedulerError> {
        let tenant = self.stream_tenant(stream_id)?;
        let worker = self
            .reserve_for_job(tenant.as_deref(), Stage::Waveform.cost())
            .await?;
        let request = WaveformRequest {
            worker_id: worker.id.clone(),
            file_path: file_path.to_string(),
        };
        let result = self.client.waveform(&worker.address, &request).await;
        self.job_outcome("waveform", &worker, result)
    }

    /// Ask the worker that produced a section image to delete it.
    pub async fn delete_section_image(
        &self,
        worker_id: &str,
        path: &str,
    ) -> Result<(), SchedulerError> {
        let worker = self
            .workers
            .get(worker_id)?
            .ok_or_else(|| SchedulerError::WorkerNotFound(worker_id.to_string()))?;
        let request = DeleteSectionImageRequest {
            worker_id: worker.id.clone(),
            path: path.to_string(),
        };
        let result = self.client.delete_section_image(&worker.address, &request).await;
        self.job_outcome("delete_section_image", &worker, result)
    }

    // ---------------------------------------------------------------------
    // Slot bookkeeping
    // ---------------------------------------------------------------------

    /// Release bound slots whose stream ended at least one cooldown ago.
    ///
    /// Covers delayed releases lost to a coordinator restart.
    pub fn release_expired_slots(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let cooldown = chrono::Duration::seconds(self.config.slot_cooldown_secs as i64);
        let mut released = 0;

        for slot in self.slots.list_slots()? {
            let Some(stream_id) = slot.stream_id else {
                continue;
            };
            let expired = match self.streams.get_stream(stream_id)? {
                Some(stream) => {
                    let ended = stream
                        .finished_at()
                        .map_or(stream.end, |finished| finished.max(stream.end));
                    now.signed_duration_since(ended) >= cooldown
                }
                None => true,
            };
            if expired && self.slots.release_slot(&slot.name, now)? {
                info!(slot = %slot.name, stream_id, "Released slot after cooldown");
                metrics::SLOTS_RELEASED.inc();
                released += 1;
            }
        }
        Ok(released)
    }

    /// Bound slots of running streams that no alive worker reports.
    ///
    /// Orphans are logged and counted, never re-dispatched.
    pub async fn find_orphaned_slots(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<IngestSlot>, SchedulerError> {
        // Slots claimed by an in-flight pass are not reported yet
        let _guard = self.pass_lock.lock().await;
        let workers = self.alive_workers(now)?;
        let mut orphans = Vec::new();

        for slot in self.slots.list_slots()? {
            let Some(stream_id) = slot.stream_id else {
                continue;
            };
            let Some(stream) = self.streams.get_stream(stream_id)? else {
                continue;
            };

            let running = if stream.premiere_slot.as_deref() == Some(slot.name.as_str()) {
                now < stream.end
            } else {
                stream
                    .sources
                    .iter()
                    .find(|s| s.slot_name.as_deref() == Some(slot.name.as_str()))
                    .is_some_and(|s| s.finished_at.is_none())
            };
            if running && !workers.iter().any(|w| w.reports_job(&slot.name)) {
                warn!(slot = %slot.name, stream_id, "Slot is bound but no alive worker reports it");
                orphans.push(slot);
            }
        }

        metrics::ORPHANED_SLOTS.set(orphans.len() as i64);
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SqliteRegistry;
    use crate::rpc::IDENTITY_MISMATCH;
    use crate::silence::Silence;
    use crate::streams::{NewStream, SqliteStreamStore, Stream};
    use crate::testing::{fixtures, MockWorkerClient};

    struct Harness {
        scheduler: Arc<Scheduler>,
        registry: Arc<SqliteRegistry>,
        streams: Arc<SqliteStreamStore>,
        client: Arc<MockWorkerClient>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(SqliteRegistry::in_memory().unwrap());
        let streams = Arc::new(SqliteStreamStore::in_memory().unwrap());
        let client = Arc::new(MockWorkerClient::new());
        let scheduler = Arc::new(Scheduler::new(
            CoordinatorConfig::default(),
            registry.clone(),
            registry.clone(),
            streams.clone(),
            client.clone(),
        ));
        Harness {
            scheduler,
            registry,
            streams,
            client,
        }
    }

    /// Stream store whose dispatch bookkeeping always fails.
    struct UnrecordableStore(SqliteStreamStore);

    impl StreamStore for UnrecordableStore {
        fn create_stream(&self, stream: &NewStream) -> Result<i64, StoreError> {
            self.0.create_stream(stream)
        }
        fn get_stream(&self, id: i64) -> Result<Option<Stream>, StoreError> {
            self.0.get_stream(id)
        }
        fn due_streams(
            &self,
            now: DateTime<Utc>,
            lookahead: chrono::Duration,
        ) -> Result<Vec<DueStream>, StoreError> {
            self.0.due_streams(now, lookahead)
        }
        fn due_premieres(
            &self,
            now: DateTime<Utc>,
            lookahead: chrono::Duration,
        ) -> Result<Vec<DuePremiere>, StoreError> {
            self.0.due_premieres(now, lookahead)
        }
        fn record_dispatch(
            &self,
            _stream_id: i64,
            _variant: SourceVariant,
            _worker_id: &str,
            _slot_name: &str,
        ) -> Result<(), StoreError> {
            Err(StoreError::Database("disk I/O error".to_string()))
        }
        fn record_premiere_dispatch(
            &self,
            _stream_id: i64,
            _worker_id: &str,
            _slot_name: &str,
        ) -> Result<(), StoreError> {
            Err(StoreError::Database("disk I/O error".to_string()))
        }
        fn set_live(&self, id: i64, v: SourceVariant, url: &str) -> Result<(), StoreError> {
            self.0.set_live(id, v, url)
        }
        fn set_finished(
            &self,
            id: i64,
            v: SourceVariant,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.0.set_finished(id, v, at)
        }
        fn set_recording(
            &self,
            id: i64,
            v: SourceVariant,
            path: &str,
            duration_secs: f64,
        ) -> Result<(), StoreError> {
            self.0.set_recording(id, v, path, duration_secs)
        }
        fn set_published(
            &self,
            id: i64,
            v: SourceVariant,
            vod_url: &str,
            thumbnail_url: Option<&str>,
        ) -> Result<(), StoreError> {
            self.0.set_published(id, v, vod_url, thumbnail_url)
        }
        fn set_silences(&self, id: i64, silences: &[Silence]) -> Result<(), StoreError> {
            self.0.set_silences(id, silences)
        }
    }

    #[tokio::test]
    async fn test_unrecorded_dispatch_is_cancelled_and_slot_released() {
        let registry = Arc::new(SqliteRegistry::in_memory().unwrap());
        let streams = Arc::new(UnrecordableStore(SqliteStreamStore::in_memory().unwrap()));
        let client = Arc::new(MockWorkerClient::new());
        let scheduler = Scheduler::new(
            CoordinatorConfig::default(),
            registry.clone(),
            registry.clone(),
            streams.clone(),
            client.clone(),
        );
        let now = Utc::now();
        fixtures::register_worker(registry.as_ref(), "w1", 0, now);
        add_slots(&registry, 1, 0);
        streams
            .create_stream(&fixtures::new_stream(now, &[SourceVariant::Camera]))
            .unwrap();

        let report = scheduler.run_pass(now).await.unwrap();

        assert_eq!(report.accepted, 0);
        assert_eq!(report.rejected, 1);
        let cancellations = client.cancellations().await;
        assert_eq!(cancellations.len(), 1);
        assert_eq!(cancellations[0].worker_id, "w1");
        assert_eq!(cancellations[0].slot_name.as_deref(), Some("plain-0"));
        assert!(cancellations[0].discard);
        assert!(registry.get_slot("plain-0").unwrap().unwrap().is_free());
        // +3 for the capture, -1 for the failure
        assert_eq!(registry.get("w1").unwrap().unwrap().workload, 2);
    }

    fn add_slots(registry: &SqliteRegistry, plain: usize, transcoding: usize) {
        let server = registry.add_server("rtmp://ingest.example/live").unwrap();
        for i in 0..plain {
            registry
                .add_slot(server.id, &format!("plain-{}", i), false)
                .unwrap();
        }
        for i in 0..transcoding {
            registry
                .add_slot(server.id, &format!("tc-{}", i), true)
                .unwrap();
        }
    }

    #[test]
    fn test_select_worker_least_workload() {
        let now = Utc::now();
        let workers = vec![
            fixtures::worker("w1", 5, now),
            fixtures::worker("w2", 0, now),
            fixtures::worker("w3", 0, now),
        ];
        assert_eq!(select_worker(&workers, None), Some(1));
    }

    #[test]
    fn test_select_worker_respects_tenant() {
        let now = Utc::now();
        let mut private = fixtures::worker("w1", 0, now);
        private.shared = false;
        private.tenant = Some("tum".to_string());
        let mut other = fixtures::worker("w2", 0, now);
        other.shared = false;
        other.tenant = Some("lmu".to_string());
        let workers = vec![private, other];

        assert_eq!(select_worker(&workers, Some("lmu")), Some(1));
        assert_eq!(select_worker(&workers, Some("hm")), None);
    }

    #[tokio::test]
    async fn test_pass_picks_least_loaded_and_adds_cost() {
        let h = harness();
        let now = Utc::now();
        fixtures::register_worker(h.registry.as_ref(), "w1", 0, now);
        fixtures::register_worker(h.registry.as_ref(), "w2", 5, now);
        add_slots(&h.registry, 1, 0);
        h.streams
            .create_stream(&fixtures::new_stream(now, &[SourceVariant::Camera]))
            .unwrap();

        let report = h.scheduler.run_pass(now).await.unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(h.registry.get("w1").unwrap().unwrap().workload, 3);
        assert_eq!(h.registry.get("w2").unwrap().unwrap().workload, 5);
        assert_eq!(h.client.assignments().await[0].worker_id, "w1");
    }

    #[tokio::test]
    async fn test_workload_visible_to_next_source_in_pass() {
        let h = harness();
        let now = Utc::now();
        fixtures::register_worker(h.registry.as_ref(), "w1", 0, now);
        fixtures::register_worker(h.registry.as_ref(), "w2", 2, now);
        add_slots(&h.registry, 2, 1);
        h.streams
            .create_stream(&fixtures::new_stream(
                now,
                &[SourceVariant::Combined, SourceVariant::Camera],
            ))
            .unwrap();

        h.scheduler.run_pass(now).await.unwrap();
        let assignments = h.client.assignments().await;
        assert_eq!(assignments.len(), 2);
        // w1 went to 3, so the second source goes to w2 (2)
        assert_eq!(assignments[0].worker_id, "w1");
        assert_eq!(assignments[1].worker_id, "w2");
    }

    #[tokio::test]
    async fn test_combined_prefers_transcoding_slot() {
        let h = harness();
        let now = Utc::now();
        fixtures::register_worker(h.registry.as_ref(), "w1", 0, now);
        add_slots(&h.registry, 1, 1);
        h.streams
            .create_stream(&fixtures::new_stream(
                now,
                &[SourceVariant::Combined, SourceVariant::Camera],
            ))
            .unwrap();

        h.scheduler.run_pass(now).await.unwrap();
        let assignments = h.client.assignments().await;
        let comb = assignments
            .iter()
            .find(|a| a.source_type == SourceVariant::Combined)
            .unwrap();
        assert_eq!(comb.slot_name, "tc-0");
        let cam = assignments
            .iter()
            .find(|a| a.source_type == SourceVariant::Camera)
            .unwrap();
        assert_eq!(cam.slot_name, "plain-0");
    }

    #[tokio::test]
    async fn test_dial_failure_nets_cost_minus_one() {
        let h = harness();
        let now = Utc::now();
        fixtures::register_worker(h.registry.as_ref(), "w1", 0, now);
        add_slots(&h.registry, 1, 0);
        h.streams
            .create_stream(&fixtures::new_stream(now, &[SourceVariant::Camera]))
            .unwrap();
        h.client
            .fail_address("http://w1:8081", RpcError::Transport("connection refused".to_string()))
            .await;

        let report = h.scheduler.run_pass(now).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(h.registry.get("w1").unwrap().unwrap().workload, 2);
        // Slot is free again and the source is still due
        assert!(h.registry.get_slot("plain-0").unwrap().unwrap().is_free());
        assert_eq!(h.streams.due_streams(now, chrono::Duration::minutes(10)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_reason_is_reported() {
        let h = harness();
        let now = Utc::now();
        fixtures::register_worker(h.registry.as_ref(), "w1", 0, now);
        add_slots(&h.registry, 1, 0);
        let id = h
            .streams
            .create_stream(&fixtures::new_stream(now, &[SourceVariant::Camera]))
            .unwrap();
        h.client
            .fail_address("http://w1:8081", RpcError::Rejected(IDENTITY_MISMATCH.to_string()))
            .await;

        let stream = h.streams.due_streams(now, chrono::Duration::minutes(10)).unwrap();
        let mut workers = h.scheduler.alive_workers(now).unwrap();
        let result = h
            .scheduler
            .dispatch_source(&stream[0], &stream[0].sources[0], &mut workers, now)
            .await
            .unwrap();
        assert_eq!(
            result,
            DispatchResult::Rejected {
                worker_id: "w1".to_string(),
                reason: IDENTITY_MISMATCH.to_string()
            }
        );
        assert_eq!(workers[0].workload, 2);
        assert!(h.streams.get_stream(id).unwrap().unwrap().sources[0].worker_id.is_none());
    }

    #[tokio::test]
    async fn test_no_alive_workers_aborts_pass() {
        let h = harness();
        let now = Utc::now();
        fixtures::register_worker(
            h.registry.as_ref(),
            "stale",
            0,
            now - chrono::Duration::minutes(6),
        );
        add_slots(&h.registry, 1, 0);
        h.streams
            .create_stream(&fixtures::new_stream(now, &[SourceVariant::Camera]))
            .unwrap();

        let report = h.scheduler.run_pass(now).await.unwrap();
        assert!(report.aborted);
        assert!(h.client.assignments().await.is_empty());
        assert!(h.registry.get_slot("plain-0").unwrap().unwrap().is_free());
    }

    #[tokio::test]
    async fn test_no_free_slot_skips_source() {
        let h = harness();
        let now = Utc::now();
        fixtures::register_worker(h.registry.as_ref(), "w1", 0, now);
        h.streams
            .create_stream(&fixtures::new_stream(now, &[SourceVariant::Camera]))
            .unwrap();

        let report = h.scheduler.run_pass(now).await.unwrap();
        assert_eq!(report.skipped_no_slot, 1);
        assert_eq!(h.registry.get("w1").unwrap().unwrap().workload, 0);
    }

    #[tokio::test]
    async fn test_concurrent_passes_claim_slot_once() {
        let h = harness();
        let now = Utc::now();
        fixtures::register_worker(h.registry.as_ref(), "w1", 0, now);
        add_slots(&h.registry, 1, 0);
        h.streams
            .create_stream(&fixtures::new_stream(now, &[SourceVariant::Camera]))
            .unwrap();
        h.streams
            .create_stream(&fixtures::new_stream(now, &[SourceVariant::Camera]))
            .unwrap();

        let a = tokio::spawn({
            let s = h.scheduler.clone();
            async move { s.run_pass(now).await.unwrap() }
        });
        let b = tokio::spawn({
            let s = h.scheduler.clone();
            async move { s.run_pass(now).await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a.accepted + b.accepted, 1);
        assert_eq!(h.client.assignments().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_stream_cancels_reporting_worker() {
        let h = harness();
        let now = Utc::now();
        fixtures::register_worker(h.registry.as_ref(), "w1", 0, now);
        fixtures::register_worker(h.registry.as_ref(), "w2", 1, now);
        add_slots(&h.registry, 1, 0);
        let id = h
            .streams
            .create_stream(&fixtures::new_stream(now, &[SourceVariant::Camera]))
            .unwrap();
        h.scheduler.run_pass(now).await.unwrap();
        fixtures::report_jobs(h.registry.as_ref(), "w1", &["capture plain-0 stream 1 (CAM)"]);

        let report = h.scheduler.stop_stream(id, true).await.unwrap();
        assert_eq!(report.cancelled, 1);
        let cancels = h.client.cancellations().await;
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].worker_id, "w1");
        assert_eq!(cancels[0].slot_name.as_deref(), Some("plain-0"));
        assert!(cancels[0].discard);
    }

    #[tokio::test]
    async fn test_stop_stream_failure_penalizes() {
        let h = harness();
        let now = Utc::now();
        fixtures::register_worker(h.registry.as_ref(), "w1", 0, now);
        add_slots(&h.registry, 1, 0);
        let id = h
            .streams
            .create_stream(&fixtures::new_stream(now, &[SourceVariant::Camera]))
            .unwrap();
        h.scheduler.run_pass(now).await.unwrap();
        fixtures::report_jobs(h.registry.as_ref(), "w1", &["capture plain-0 stream 1 (CAM)"]);
        h.registry.adjust_workload("w1", 3).unwrap();
        h.client
            .fail_address("http://w1:8081", RpcError::Timeout(5))
            .await;

        let report = h.scheduler.stop_stream(id, false).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(h.registry.get("w1").unwrap().unwrap().workload, 2);
    }

    #[tokio::test]
    async fn test_release_expired_slots() {
        let h = harness();
        let start = Utc::now() - chrono::Duration::hours(5);
        fixtures::register_worker(h.registry.as_ref(), "w1", 0, start);
        add_slots(&h.registry, 1, 0);
        let mut stream = fixtures::new_stream(start, &[SourceVariant::Camera]);
        stream.end = start + chrono::Duration::hours(1);
        h.streams.create_stream(&stream).unwrap();
        h.scheduler.run_pass(start).await.unwrap();
        assert!(!h.registry.get_slot("plain-0").unwrap().unwrap().is_free());

        // One hour after the end: still cooling down
        let released = h
            .scheduler
            .release_expired_slots(start + chrono::Duration::hours(2))
            .unwrap();
        assert_eq!(released, 0);

        let released = h
            .scheduler
            .release_expired_slots(start + chrono::Duration::hours(3))
            .unwrap();
        assert_eq!(released, 1);
        assert!(h.registry.get_slot("plain-0").unwrap().unwrap().is_free());
    }

    #[tokio::test]
    async fn test_orphaned_slot_detected() {
        let h = harness();
        let now = Utc::now();
        fixtures::register_worker(h.registry.as_ref(), "w1", 0, now);
        add_slots(&h.registry, 2, 0);
        h.streams
            .create_stream(&fixtures::new_stream(
                now,
                &[SourceVariant::Camera, SourceVariant::Presentation],
            ))
            .unwrap();
        h.scheduler.run_pass(now).await.unwrap();
        let assignments = h.client.assignments().await;
        // Only one of the two captures is reported
        let job = format!("capture {} stream 1", assignments[0].slot_name);
        fixtures::report_jobs(h.registry.as_ref(), "w1", &[job.as_str()]);

        let orphans = h.scheduler.find_orphaned_slots(now).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].name, assignments[1].slot_name);
    }

    #[tokio::test]
    async fn test_adhoc_job_no_worker() {
        let h = harness();
        let err = h
            .scheduler
            .live_preview("rtsp://cam", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoEligibleWorker));
    }

    #[tokio::test]
    async fn test_adhoc_job_reserves_cost() {
        let h = harness();
        let now = Utc::now();
        fixtures::register_worker(h.registry.as_ref(), "w1", 0, now);
        h.scheduler.live_preview("rtsp://cam", None).await.unwrap();
        assert_eq!(
            h.registry.get("w1").unwrap().unwrap().workload,
            Stage::LivePreview.cost()
        );
    }
}

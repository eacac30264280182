//! Coordinator and worker wired together in one process.
//!
//! The control protocol is replaced by loopback clients that call the
//! other side directly, so these tests cover the whole path from a dispatch
//! pass through the worker pipeline back to the stream store:
//! - Dispatch of every source of a stream, with a transcoding slot for COMB
//! - Notifications updating the stream record
//! - Heartbeats keeping the coordinator's workload in sync
//! - Slot release after the cooldown
//! - Stopping a stream with and without discarding the recording

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use castfleet_core::{
    deletion::DeletionQueue,
    registry::{IngestStore, SqliteRegistry, WorkerStore},
    rpc::*,
    scheduler::{CoordinatorConfig, CoordinatorService, Scheduler},
    status::{StatusReporter, WorkerIdentity},
    streams::{SourceVariant, SqliteStreamStore, StreamStore},
    testing::{fixtures, MockEncoder, MockPublisher},
    worker::{PipelineEngine, Publisher},
};

/// Delivers worker calls straight to a [`CoordinatorService`].
struct LoopbackCoordinator {
    service: Arc<CoordinatorService>,
}

fn rejected(e: impl std::fmt::Display) -> RpcError {
    RpcError::Rejected(e.to_string())
}

#[async_trait]
impl CoordinatorClient for LoopbackCoordinator {
    async fn register(&self, req: &RegisterRequest) -> Result<(), RpcError> {
        self.service.register(req).map(|_| ()).map_err(rejected)
    }

    async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<(), RpcError> {
        self.service.heartbeat(req).map(|_| ()).map_err(rejected)
    }

    async fn stream_started(&self, req: &StreamStartedRequest) -> Result<(), RpcError> {
        self.service.stream_started(req).map_err(rejected)
    }

    async fn stream_finished(&self, req: &StreamFinishedRequest) -> Result<(), RpcError> {
        self.service.stream_finished(req).map_err(rejected)
    }

    async fn transcoding_finished(
        &self,
        req: &TranscodingFinishedRequest,
    ) -> Result<(), RpcError> {
        self.service.transcoding_finished(req).map_err(rejected)
    }

    async fn publish_finished(&self, req: &PublishFinishedRequest) -> Result<(), RpcError> {
        self.service.publish_finished(req).map_err(rejected)
    }

    async fn silence_results(&self, req: &SilenceResultsRequest) -> Result<(), RpcError> {
        self.service.silence_results(req).map_err(rejected)
    }

    async fn stage_failed(&self, req: &StageFailedRequest) -> Result<(), RpcError> {
        self.service.stage_failed(req).map_err(rejected)
    }
}

/// Delivers coordinator calls straight to a [`PipelineEngine`].
struct LoopbackWorker {
    engine: Arc<PipelineEngine>,
}

#[async_trait]
impl WorkerClient for LoopbackWorker {
    async fn assign_stream(
        &self,
        _address: &str,
        req: &AssignStreamRequest,
    ) -> Result<(), RpcError> {
        self.engine.assign_stream(req.clone()).await.map_err(rejected)
    }

    async fn cancel_stream(
        &self,
        _address: &str,
        req: &CancelStreamRequest,
    ) -> Result<CancelStreamResponse, RpcError> {
        let cancelled = self.engine.cancel_stream(req).await.map_err(rejected)?;
        Ok(CancelStreamResponse {
            ok: true,
            cancelled,
        })
    }

    async fn assign_premiere(
        &self,
        _address: &str,
        req: &AssignPremiereRequest,
    ) -> Result<(), RpcError> {
        self.engine.assign_premiere(req.clone()).await.map_err(rejected)
    }

    async fn generate_thumbnails(
        &self,
        _address: &str,
        req: &GenerateThumbnailsRequest,
    ) -> Result<ThumbnailsResponse, RpcError> {
        self.engine.generate_thumbnails(req).await.map_err(rejected)
    }

    async fn live_preview(
        &self,
        _address: &str,
        req: &LivePreviewRequest,
    ) -> Result<LivePreviewResponse, RpcError> {
        self.engine.live_preview(req).await.map_err(rejected)
    }

    async fn section_images(
        &self,
        _address: &str,
        req: &SectionImagesRequest,
    ) -> Result<SectionImagesResponse, RpcError> {
        self.engine.section_images(req).await.map_err(rejected)
    }

    async fn delete_section_image(
        &self,
        _address: &str,
        req: &DeleteSectionImageRequest,
    ) -> Result<(), RpcError> {
        self.engine.delete_section_image(req).await.map_err(rejected)
    }

    async fn waveform(
        &self,
        _address: &str,
        req: &WaveformRequest,
    ) -> Result<WaveformResponse, RpcError> {
        self.engine.waveform(req).await.map_err(rejected)
    }
}

struct Fleet {
    scheduler: Scheduler,
    service: Arc<CoordinatorService>,
    engine: Arc<PipelineEngine>,
    registry: Arc<SqliteRegistry>,
    streams: Arc<SqliteStreamStore>,
    encoder: Arc<MockEncoder>,
    publisher: Arc<MockPublisher>,
    _dir: TempDir,
}

impl Fleet {
    async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let registry = Arc::new(SqliteRegistry::in_memory().expect("registry"));
        let streams = Arc::new(SqliteStreamStore::in_memory().expect("stream store"));

        let config = CoordinatorConfig {
            health_check_enabled: false,
            slot_cooldown_secs: 0,
            ..CoordinatorConfig::default()
        };
        let service = Arc::new(CoordinatorService::new(
            config.clone(),
            registry.clone(),
            registry.clone(),
            streams.clone(),
            None,
        ));

        let worker_config = fixtures::worker_config("w1", dir.path());
        let coordinator = Arc::new(LoopbackCoordinator {
            service: service.clone(),
        });
        let status = Arc::new(StatusReporter::new(
            WorkerIdentity {
                id: "w1".to_string(),
                address: worker_config.address.clone(),
                version: "test".to_string(),
                tenant: None,
                shared: true,
            },
            coordinator.clone(),
        ));
        status.register().await.expect("registration");

        let deletion = Arc::new(
            DeletionQueue::load(&worker_config.deletion_queue_file, chrono::Duration::hours(24))
                .await
                .expect("deletion queue"),
        );
        let encoder = Arc::new(MockEncoder::new());
        let publisher = Arc::new(MockPublisher::new());
        let engine = Arc::new(PipelineEngine::new(
            worker_config,
            encoder.clone(),
            Some(publisher.clone() as Arc<dyn Publisher>),
            coordinator,
            status,
            deletion,
        ));

        let scheduler = Scheduler::new(
            config,
            registry.clone(),
            registry.clone(),
            streams.clone(),
            Arc::new(LoopbackWorker {
                engine: engine.clone(),
            }),
        );

        let server = registry
            .add_server("rtmp://ingest.example/live")
            .expect("ingest server");
        registry.add_slot(server.id, "plain-0", false).expect("slot");
        registry.add_slot(server.id, "tc-0", true).expect("slot");

        Self {
            scheduler,
            service,
            engine,
            registry,
            streams,
            encoder,
            publisher,
            _dir: dir,
        }
    }

    /// Wait for every pipeline and every coordinator side task.
    async fn settle(&self) {
        self.engine.wait_idle().await;
        self.service.wait_side_tasks().await;
    }
}

#[tokio::test]
async fn test_stream_runs_through_the_whole_fleet() {
    let fleet = Fleet::new().await;
    fleet
        .encoder
        .set_silence_output("silence_start: 120\nsilence_end: 180\n")
        .await;

    let now = Utc::now();
    let mut stream = fixtures::new_stream(now, &[SourceVariant::Combined, SourceVariant::Camera]);
    stream.end = now + chrono::Duration::milliseconds(400);
    let id = fleet.streams.create_stream(&stream).unwrap();

    let report = fleet.scheduler.run_pass(Utc::now()).await.unwrap();
    assert_eq!(report.accepted, 2);

    // COMB got the transcoding slot, CAM the plain one
    let dispatched = fleet.streams.get_stream(id).unwrap().unwrap();
    let slot_of = |variant| {
        dispatched
            .sources
            .iter()
            .find(|s| s.variant == variant)
            .and_then(|s| s.slot_name.clone())
    };
    assert_eq!(slot_of(SourceVariant::Combined).as_deref(), Some("tc-0"));
    assert_eq!(slot_of(SourceVariant::Camera).as_deref(), Some("plain-0"));

    fleet.settle().await;

    let finished = fleet.streams.get_stream(id).unwrap().unwrap();
    for source in &finished.sources {
        assert_eq!(source.worker_id.as_deref(), Some("w1"));
        assert!(source.finished_at.is_some(), "{} not finished", source.variant);
        assert_eq!(source.duration_secs, Some(3600.0));
        assert!(source.vod_url.is_some());
        assert!(source.live_url.is_some());
    }
    assert_eq!(finished.silences.len(), 1);
    assert_eq!((finished.silences[0].start, finished.silences[0].end), (120, 180));
    assert_eq!(fleet.publisher.published().await.len(), 2);

    // The last heartbeat after both pipelines finished reports an idle worker
    assert_eq!(fleet.registry.get("w1").unwrap().unwrap().workload, 0);
    assert!(fleet
        .registry
        .list_slots()
        .unwrap()
        .iter()
        .all(|slot| slot.is_free()));
}

#[tokio::test]
async fn test_dispatched_stream_is_not_dispatched_again() {
    let fleet = Fleet::new().await;
    let now = Utc::now();
    let mut stream = fixtures::new_stream(now, &[SourceVariant::Camera]);
    stream.end = now + chrono::Duration::hours(1);
    fleet.streams.create_stream(&stream).unwrap();

    assert_eq!(fleet.scheduler.run_pass(Utc::now()).await.unwrap().accepted, 1);
    assert_eq!(fleet.scheduler.run_pass(Utc::now()).await.unwrap().accepted, 0);
    assert_eq!(fleet.engine.active_assignments().await.len(), 1);

    fleet.engine.drain().await;
    fleet.settle().await;
}

#[tokio::test]
async fn test_stop_with_discard_throws_recording_away() {
    let fleet = Fleet::new().await;
    let now = Utc::now();
    let mut stream = fixtures::new_stream(now, &[SourceVariant::Camera]);
    stream.end = now + chrono::Duration::hours(1);
    let id = fleet.streams.create_stream(&stream).unwrap();

    fleet.scheduler.run_pass(Utc::now()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The capture job heartbeat told the coordinator which worker holds the slot
    assert!(fleet
        .registry
        .get("w1")
        .unwrap()
        .unwrap()
        .reports_job("plain-0"));

    let report = fleet.scheduler.stop_stream(id, true).await.unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.failed, 0);
    fleet.settle().await;

    assert!(fleet.encoder.transcodes().await.is_empty());
    let stopped = fleet.streams.get_stream(id).unwrap().unwrap();
    assert!(stopped.sources[0].finished_at.is_some());
    assert!(stopped.sources[0].recording_path.is_none());

    // Stopping again finds nothing running
    let again = fleet.scheduler.stop_stream(id, true).await.unwrap();
    assert_eq!(again.cancelled, 0);
}

#[tokio::test]
async fn test_stop_without_discard_keeps_partial_recording() {
    let fleet = Fleet::new().await;
    let now = Utc::now();
    let mut stream = fixtures::new_stream(now, &[SourceVariant::Combined]);
    stream.end = now + chrono::Duration::hours(1);
    let id = fleet.streams.create_stream(&stream).unwrap();

    fleet.scheduler.run_pass(Utc::now()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = fleet.scheduler.stop_stream(id, false).await.unwrap();
    assert_eq!(report.cancelled, 1);
    fleet.settle().await;

    assert_eq!(fleet.encoder.transcodes().await.len(), 1);
    let stopped = fleet.streams.get_stream(id).unwrap().unwrap();
    assert!(stopped.sources[0].recording_path.is_some());
}

#[tokio::test]
async fn test_ad_hoc_jobs_reach_the_worker() {
    let fleet = Fleet::new().await;
    let id = fleet
        .streams
        .create_stream(&fixtures::new_stream(
            Utc::now() + chrono::Duration::days(1),
            &[SourceVariant::Camera],
        ))
        .unwrap();

    let vod = fleet.engine.config().output_dir.join("eidi.mp4");
    tokio::fs::create_dir_all(vod.parent().unwrap()).await.unwrap();
    tokio::fs::write(&vod, b"vod").await.unwrap();
    let vod = vod.to_string_lossy().to_string();

    let thumbnails = fleet.scheduler.generate_thumbnails(id, &vod).await.unwrap();
    assert!(thumbnails.sprite_path.ends_with("sprite.jpg"));

    let sections = fleet
        .scheduler
        .section_images(id, &vod, vec![60, 120])
        .await
        .unwrap();
    assert_eq!(sections.paths.len(), 2);

    fleet
        .scheduler
        .delete_section_image("w1", &sections.paths[0])
        .await
        .unwrap();

    let waveform = fleet.scheduler.waveform(id, &vod).await.unwrap();
    assert!(!waveform.waveform.is_empty());

    fleet.settle().await;
    assert_eq!(fleet.registry.get("w1").unwrap().unwrap().workload, 0);
}

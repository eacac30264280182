//! Coordinator-side handling of worker calls.
//!
//! Workers push registrations, heartbeats and stage notifications. The
//! service records them and starts detached side tasks (live health check,
//! hall hooks, delayed slot release). Side task failures are logged and
//! counted, never returned to the worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::config::CoordinatorConfig;
use super::hooks::{HallEvent, HallHook, HallNotification};
use super::types::SchedulerError;
use crate::metrics;
use crate::registry::{IngestStore, Worker, WorkerHeartbeat, WorkerRegistration, WorkerStore};
use crate::rpc::{
    HeartbeatRequest, PublishFinishedRequest, RegisterRequest, SilenceResultsRequest,
    StageFailedRequest, StreamFinishedRequest, StreamStartedRequest, TranscodingFinishedRequest,
};
use crate::silence::Silence;
use crate::streams::StreamStore;

/// Records what workers report and runs the follow-up side tasks.
pub struct CoordinatorService {
    config: CoordinatorConfig,
    workers: Arc<dyn WorkerStore>,
    slots: Arc<dyn IngestStore>,
    streams: Arc<dyn StreamStore>,
    hall_hook: Option<Arc<dyn HallHook>>,
    http: Client,
    side_tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl CoordinatorService {
    pub fn new(
        config: CoordinatorConfig,
        workers: Arc<dyn WorkerStore>,
        slots: Arc<dyn IngestStore>,
        streams: Arc<dyn StreamStore>,
        hall_hook: Option<Arc<dyn HallHook>>,
    ) -> Self {
        Self {
            config,
            workers,
            slots,
            streams,
            hall_hook,
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            side_tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Notifications are accepted only from registered workers.
    fn known_worker(&self, worker_id: &str) -> Result<Worker, SchedulerError> {
        self.workers.get(worker_id)?.ok_or_else(|| {
            warn!(worker_id, "Notification from unknown worker");
            SchedulerError::IdentityMismatch
        })
    }

    pub fn register(&self, req: &RegisterRequest) -> Result<Worker, SchedulerError> {
        if req.worker_id.trim().is_empty() {
            return Err(SchedulerError::Malformed("worker_id is empty".to_string()));
        }
        let worker = self.workers.register(
            &WorkerRegistration {
                id: req.worker_id.clone(),
                address: req.address.clone(),
                tenant: req.tenant.clone(),
                shared: req.shared,
                version: req.version.clone(),
            },
            Utc::now(),
        )?;
        info!(worker_id = %worker.id, address = %worker.address, shared = worker.shared, "Worker registered");
        Ok(worker)
    }

    /// Record a heartbeat. Unknown workers are created from it.
    pub fn heartbeat(&self, req: &HeartbeatRequest) -> Result<Worker, SchedulerError> {
        if req.worker_id.trim().is_empty() {
            return Err(SchedulerError::Malformed("worker_id is empty".to_string()));
        }
        let worker = self.workers.record_heartbeat(
            &WorkerHeartbeat {
                id: req.worker_id.clone(),
                address: req.address.clone(),
                workload: req.workload,
                jobs: req.jobs.clone(),
                version: Some(req.version.clone()),
                stats: Some(req.stats),
                shared: req.shared,
                tenant: req.tenant.clone(),
            },
            Utc::now(),
        )?;
        debug!(worker_id = %worker.id, workload = worker.workload, jobs = worker.jobs.len(), "Heartbeat");
        Ok(worker)
    }

    pub fn stream_started(&self, req: &StreamStartedRequest) -> Result<(), SchedulerError> {
        self.known_worker(&req.worker_id)?;
        let stream = self
            .streams
            .get_stream(req.stream_id)?
            .ok_or(SchedulerError::StreamNotFound(req.stream_id))?;
        info!(
            stream_id = req.stream_id,
            variant = %req.source_type,
            worker_id = %req.worker_id,
            premiere = req.premiere,
            "Stream started"
        );

        if let Some(ref live_url) = req.live_url {
            if !req.premiere {
                self.streams
                    .set_live(req.stream_id, req.source_type, live_url)?;
            }
            if self.config.health_check_enabled {
                self.spawn_health_check(req.stream_id, live_url.clone());
            }
        }
        self.spawn_hall_hook(HallNotification {
            event: HallEvent::StreamStarted,
            stream_id: stream.id,
            course_slug: stream.course_slug,
            stream_name: stream.name,
        });
        Ok(())
    }

    pub fn stream_finished(&self, req: &StreamFinishedRequest) -> Result<(), SchedulerError> {
        self.known_worker(&req.worker_id)?;
        let stream = self
            .streams
            .get_stream(req.stream_id)?
            .ok_or(SchedulerError::StreamNotFound(req.stream_id))?;
        info!(
            stream_id = req.stream_id,
            variant = %req.source_type,
            slot = %req.slot_name,
            premiere = req.premiere,
            "Stream finished"
        );

        if !req.premiere {
            self.streams
                .set_finished(req.stream_id, req.source_type, Utc::now())?;
        }
        self.schedule_slot_release(
            req.slot_name.clone(),
            req.stream_id,
            self.config.slot_cooldown(),
        );
        self.spawn_hall_hook(HallNotification {
            event: HallEvent::StreamFinished,
            stream_id: stream.id,
            course_slug: stream.course_slug,
            stream_name: stream.name,
        });
        Ok(())
    }

    pub fn transcoding_finished(
        &self,
        req: &TranscodingFinishedRequest,
    ) -> Result<(), SchedulerError> {
        self.known_worker(&req.worker_id)?;
        self.streams.set_recording(
            req.stream_id,
            req.source_type,
            &req.file_path,
            req.duration_secs,
        )?;
        info!(
            stream_id = req.stream_id,
            variant = %req.source_type,
            duration_secs = req.duration_secs,
            "Transcoding finished"
        );
        Ok(())
    }

    pub fn publish_finished(&self, req: &PublishFinishedRequest) -> Result<(), SchedulerError> {
        self.known_worker(&req.worker_id)?;
        self.streams.set_published(
            req.stream_id,
            req.source_type,
            &req.vod_url,
            req.thumbnail_url.as_deref(),
        )?;
        info!(stream_id = req.stream_id, variant = %req.source_type, vod_url = %req.vod_url, "VOD published");
        Ok(())
    }

    pub fn silence_results(&self, req: &SilenceResultsRequest) -> Result<(), SchedulerError> {
        self.known_worker(&req.worker_id)?;
        if req.starts.len() != req.ends.len() {
            return Err(SchedulerError::Malformed(format!(
                "{} silence starts but {} ends",
                req.starts.len(),
                req.ends.len()
            )));
        }
        let silences: Vec<Silence> = req
            .starts
            .iter()
            .zip(&req.ends)
            .map(|(&start, &end)| Silence { start, end })
            .collect();
        self.streams.set_silences(req.stream_id, &silences)?;
        info!(stream_id = req.stream_id, intervals = silences.len(), "Silence results stored");
        Ok(())
    }

    pub fn stage_failed(&self, req: &StageFailedRequest) -> Result<(), SchedulerError> {
        self.known_worker(&req.worker_id)?;
        error!(
            stream_id = req.stream_id,
            variant = %req.source_type,
            worker_id = %req.worker_id,
            stage = %req.stage,
            error = %req.error,
            "Worker reported a failed stage"
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Side tasks
    // ---------------------------------------------------------------------

    /// Free `slot_name` once `cooldown` has passed, unless it has been
    /// rebound to another stream in the meantime.
    ///
    /// Shutdown abandons pending releases; the periodic release sweep
    /// picks them up after a restart.
    pub fn schedule_slot_release(&self, slot_name: String, stream_id: i64, cooldown: Duration) {
        let slots = Arc::clone(&self.slots);
        let shutdown = self.shutdown.clone();
        debug!(slot = %slot_name, cooldown_secs = cooldown.as_secs(), "Scheduled slot release");
        self.side_tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(cooldown) => {}
            }
            match slots.release_slot_of(&slot_name, stream_id, Utc::now()) {
                Ok(true) => {
                    info!(slot = %slot_name, stream_id, "Released slot after cooldown");
                    metrics::SLOTS_RELEASED.inc();
                }
                Ok(false) => {
                    debug!(slot = %slot_name, stream_id, "Slot already free or bound elsewhere")
                }
                Err(e) => {
                    error!(slot = %slot_name, error = %e, "Failed to release slot");
                    metrics::SIDE_TASK_FAILURES
                        .with_label_values(&["slot_release"])
                        .inc();
                }
            }
        });
    }

    fn spawn_health_check(&self, stream_id: i64, url: String) {
        let http = self.http.clone();
        let delay = Duration::from_secs(self.config.health_check_delay_secs);
        let shutdown = self.shutdown.clone();
        self.side_tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let healthy = match http.get(&url).send().await {
                Ok(response) if response.status().is_success() => true,
                Ok(response) => {
                    warn!(stream_id, url = %url, status = response.status().as_u16(), "Live stream health check failed");
                    false
                }
                Err(e) => {
                    warn!(stream_id, url = %url, error = %e, "Live stream unreachable");
                    false
                }
            };
            if healthy {
                debug!(stream_id, url = %url, "Live stream is healthy");
            } else {
                metrics::SIDE_TASK_FAILURES
                    .with_label_values(&["health_check"])
                    .inc();
            }
        });
    }

    fn spawn_hall_hook(&self, notification: HallNotification) {
        let Some(hook) = self.hall_hook.clone() else {
            return;
        };
        self.side_tasks.spawn(async move {
            if let Err(e) = hook.notify(&notification).await {
                warn!(stream_id = notification.stream_id, event = ?notification.event, error = %e, "Hall hook failed");
                metrics::SIDE_TASK_FAILURES
                    .with_label_values(&["hall_hook"])
                    .inc();
            }
        });
    }

    /// Cancel pending side tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every side task started so far.
    pub async fn wait_side_tasks(&self) {
        self.side_tasks.close();
        self.side_tasks.wait().await;
        self.side_tasks.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SlotPreference, SqliteRegistry};
    use crate::rpc::HostStats;
    use crate::streams::{SourceVariant, SqliteStreamStore};
    use crate::testing::{fixtures, MockHallHook};

    struct Harness {
        service: CoordinatorService,
        registry: Arc<SqliteRegistry>,
        streams: Arc<SqliteStreamStore>,
        hook: Arc<MockHallHook>,
    }

    fn harness(config: CoordinatorConfig) -> Harness {
        let registry = Arc::new(SqliteRegistry::in_memory().unwrap());
        let streams = Arc::new(SqliteStreamStore::in_memory().unwrap());
        let hook = Arc::new(MockHallHook::new());
        let service = CoordinatorService::new(
            config,
            registry.clone(),
            registry.clone(),
            streams.clone(),
            Some(hook.clone()),
        );
        Harness {
            service,
            registry,
            streams,
            hook,
        }
    }

    fn heartbeat(id: &str, workload: i64) -> HeartbeatRequest {
        HeartbeatRequest {
            worker_id: id.to_string(),
            address: format!("http://{}:8081", id),
            workload,
            jobs: vec![],
            version: "1.0.0".to_string(),
            stats: HostStats::default(),
            tenant: None,
            shared: None,
        }
    }

    #[test]
    fn test_heartbeat_carries_placement_for_unregistered_worker() {
        let h = harness(CoordinatorConfig::default());
        let mut req = heartbeat("w7", 0);
        req.tenant = Some("tum".to_string());
        req.shared = Some(false);

        let worker = h.service.heartbeat(&req).unwrap();
        assert_eq!(worker.tenant.as_deref(), Some("tum"));
        assert!(!worker.shared);
    }

    #[test]
    fn test_heartbeat_registers_unknown_worker() {
        let h = harness(CoordinatorConfig::default());
        let worker = h.service.heartbeat(&heartbeat("w9", 2)).unwrap();
        assert_eq!(worker.workload, 2);
        assert!(!worker.shared);

        let before = worker.last_seen;
        let worker = h.service.heartbeat(&heartbeat("w9", 5)).unwrap();
        assert_eq!(worker.workload, 5);
        assert!(worker.last_seen >= before);
        assert_eq!(h.registry.list().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_worker_notification_rejected() {
        let h = harness(CoordinatorConfig::default());
        let err = h
            .service
            .stage_failed(&StageFailedRequest {
                worker_id: "ghost".to_string(),
                stream_id: 1,
                source_type: SourceVariant::Camera,
                stage: "capture".to_string(),
                error: "boom".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, SchedulerError::IdentityMismatch));
    }

    #[test]
    fn test_silence_results_stored() {
        let h = harness(CoordinatorConfig::default());
        h.service.heartbeat(&heartbeat("w1", 0)).unwrap();
        let id = h
            .streams
            .create_stream(&fixtures::new_stream(Utc::now(), &[SourceVariant::Combined]))
            .unwrap();

        h.service
            .silence_results(&SilenceResultsRequest {
                worker_id: "w1".to_string(),
                stream_id: id,
                starts: vec![0, 300],
                ends: vec![40, 400],
            })
            .unwrap();
        let stream = h.streams.get_stream(id).unwrap().unwrap();
        assert_eq!(stream.silences, vec![Silence { start: 0, end: 40 }, Silence { start: 300, end: 400 }]);

        let err = h
            .service
            .silence_results(&SilenceResultsRequest {
                worker_id: "w1".to_string(),
                stream_id: id,
                starts: vec![0],
                ends: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_stream_finished_releases_slot_after_cooldown() {
        let config = CoordinatorConfig {
            slot_cooldown_secs: 0,
            ..Default::default()
        };
        let h = harness(config);
        h.service.heartbeat(&heartbeat("w1", 0)).unwrap();
        let server = h.registry.add_server("rtmp://ingest/live").unwrap();
        h.registry.add_slot(server.id, "s1", false).unwrap();
        let id = h
            .streams
            .create_stream(&fixtures::new_stream(Utc::now(), &[SourceVariant::Camera]))
            .unwrap();
        h.registry.claim_slot(id, SlotPreference::Plain).unwrap().unwrap();
        h.streams
            .record_dispatch(id, SourceVariant::Camera, "w1", "s1")
            .unwrap();

        h.service
            .stream_finished(&StreamFinishedRequest {
                worker_id: "w1".to_string(),
                stream_id: id,
                source_type: SourceVariant::Camera,
                slot_name: "s1".to_string(),
                premiere: false,
            })
            .unwrap();
        h.service.wait_side_tasks().await;

        assert!(h.registry.get_slot("s1").unwrap().unwrap().is_free());
        let stream = h.streams.get_stream(id).unwrap().unwrap();
        assert!(stream.sources[0].finished_at.is_some());
        let events = h.hook.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, HallEvent::StreamFinished);
    }

    #[tokio::test]
    async fn test_delayed_release_leaves_rebound_slot_alone() {
        let h = harness(CoordinatorConfig::default());
        let server = h.registry.add_server("rtmp://ingest/live").unwrap();
        h.registry.add_slot(server.id, "s1", false).unwrap();
        h.registry.claim_slot(1, SlotPreference::Plain).unwrap().unwrap();
        // Freed early by the expiry sweep and handed to stream 2
        h.registry.release_slot("s1", Utc::now()).unwrap();
        h.registry.claim_slot(2, SlotPreference::Plain).unwrap().unwrap();

        h.service
            .schedule_slot_release("s1".to_string(), 1, Duration::ZERO);
        h.service.wait_side_tasks().await;

        assert_eq!(h.registry.get_slot("s1").unwrap().unwrap().stream_id, Some(2));
    }

    #[tokio::test]
    async fn test_shutdown_abandons_pending_release() {
        let h = harness(CoordinatorConfig::default());
        let server = h.registry.add_server("rtmp://ingest/live").unwrap();
        h.registry.add_slot(server.id, "s1", false).unwrap();
        h.registry.claim_slot(1, SlotPreference::Plain).unwrap().unwrap();

        h.service
            .schedule_slot_release("s1".to_string(), 1, Duration::from_secs(7200));
        h.service.shutdown();
        h.service.wait_side_tasks().await;
        assert!(!h.registry.get_slot("s1").unwrap().unwrap().is_free());
    }

    #[tokio::test]
    async fn test_stream_started_sets_live_url_and_hooks() {
        let config = CoordinatorConfig {
            health_check_enabled: false,
            ..Default::default()
        };
        let h = harness(config);
        h.service.heartbeat(&heartbeat("w1", 0)).unwrap();
        let id = h
            .streams
            .create_stream(&fixtures::new_stream(Utc::now(), &[SourceVariant::Camera]))
            .unwrap();
        h.streams
            .record_dispatch(id, SourceVariant::Camera, "w1", "s1")
            .unwrap();

        h.service
            .stream_started(&StreamStartedRequest {
                worker_id: "w1".to_string(),
                stream_id: id,
                source_type: SourceVariant::Camera,
                slot_name: "s1".to_string(),
                live_url: Some("https://live/s1/playlist.m3u8".to_string()),
                premiere: false,
            })
            .unwrap();
        h.service.wait_side_tasks().await;

        let stream = h.streams.get_stream(id).unwrap().unwrap();
        assert_eq!(
            stream.sources[0].live_url.as_deref(),
            Some("https://live/s1/playlist.m3u8")
        );
        assert_eq!(h.hook.events().await[0].event, HallEvent::StreamStarted);
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_fail_notification() {
        let h = harness(CoordinatorConfig {
            health_check_enabled: false,
            ..Default::default()
        });
        h.hook.set_fail(true).await;
        h.service.heartbeat(&heartbeat("w1", 0)).unwrap();
        let id = h
            .streams
            .create_stream(&fixtures::new_stream(Utc::now(), &[SourceVariant::Camera]))
            .unwrap();

        h.service
            .stream_started(&StreamStartedRequest {
                worker_id: "w1".to_string(),
                stream_id: id,
                source_type: SourceVariant::Camera,
                slot_name: "s1".to_string(),
                live_url: None,
                premiere: false,
            })
            .unwrap();
        h.service.wait_side_tasks().await;
    }
}

//! Testing utilities and mock implementations.
//!
//! Mocks for every seam that talks to the outside world: the control
//! protocol in both directions, the media encoder, the VOD publisher and
//! the lecture hall hook. Together with the in-memory SQLite stores they
//! allow end-to-end tests of a coordinator and a worker without ffmpeg or
//! a network.
//!
//! # Example
//!
//! ```rust,ignore
//! use castfleet_core::testing::{fixtures, MockEncoder, MockWorkerClient};
//!
//! let client = MockWorkerClient::new();
//! let encoder = MockEncoder::new();
//!
//! fixtures::register_worker(&registry, "w1", 0, Utc::now());
//! streams.create_stream(&fixtures::new_stream(Utc::now(), &[SourceVariant::Combined]))?;
//! ```

mod mock_coordinator_client;
mod mock_encoder;
mod mock_hall_hook;
mod mock_publisher;
mod mock_worker_client;

pub use mock_coordinator_client::{MockCoordinatorClient, RecordedNotification};
pub use mock_encoder::MockEncoder;
pub use mock_hall_hook::MockHallHook;
pub use mock_publisher::MockPublisher;
pub use mock_worker_client::MockWorkerClient;

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::{DateTime, Duration, Utc};
    use std::path::Path;

    use crate::registry::{Worker, WorkerHeartbeat, WorkerRegistration, WorkerStore};
    use crate::rpc::AssignStreamRequest;
    use crate::streams::{NewStream, SourceVariant, StreamSource};
    use crate::worker::WorkerConfig;

    /// Worker config with all storage under `root` and no capture pad.
    pub fn worker_config(id: &str, root: &Path) -> WorkerConfig {
        let mut config = WorkerConfig::new(id, "http://coordinator.test")
            .with_storage_root(root)
            .with_capture_pad(0)
            .with_live_playback_base("https://live.example/hls");
        config.address = format!("http://{}:8081", id);
        config.shared = true;
        config
    }

    /// An assignment that started a minute ago and runs for an hour.
    pub fn assign_stream_request(
        worker_id: &str,
        stream_id: i64,
        variant: SourceVariant,
    ) -> AssignStreamRequest {
        let now = Utc::now();
        AssignStreamRequest {
            worker_id: worker_id.to_string(),
            stream_id,
            course_slug: "eidi".to_string(),
            stream_name: format!("Lecture {}", stream_id),
            source_type: variant,
            source_url: format!("rtsp://hall.example/{}", variant),
            start: now - Duration::minutes(1),
            end: now + Duration::hours(1),
            publish_live: true,
            publish_vod: true,
            slot_name: format!("slot-{}", stream_id),
            ingest_server: "rtmp://ingest.example/live".to_string(),
        }
    }

    /// A shared worker record, not persisted.
    pub fn worker(id: &str, workload: i64, last_seen: DateTime<Utc>) -> Worker {
        Worker {
            id: id.to_string(),
            address: format!("http://{}:8081", id),
            workload,
            last_seen,
            tenant: None,
            shared: true,
            version: Some("test".to_string()),
            jobs: Vec::new(),
            stats: None,
        }
    }

    /// Register a shared worker seen at `last_seen` carrying `workload`.
    pub fn register_worker(
        store: &dyn WorkerStore,
        id: &str,
        workload: i64,
        last_seen: DateTime<Utc>,
    ) -> Worker {
        store
            .register(
                &WorkerRegistration {
                    id: id.to_string(),
                    address: format!("http://{}:8081", id),
                    tenant: None,
                    shared: true,
                    version: Some("test".to_string()),
                },
                last_seen,
            )
            .unwrap();
        if workload != 0 {
            store.adjust_workload(id, workload).unwrap();
        }
        store.get(id).unwrap().unwrap()
    }

    /// Replace a registered worker's job list, keeping its workload.
    pub fn report_jobs(store: &dyn WorkerStore, id: &str, jobs: &[&str]) -> Worker {
        let current = store.get(id).unwrap().unwrap();
        store
            .record_heartbeat(
                &WorkerHeartbeat {
                    id: id.to_string(),
                    address: current.address.clone(),
                    workload: current.workload,
                    jobs: jobs.iter().map(|j| j.to_string()).collect(),
                    version: current.version.clone(),
                    stats: current.stats,
                    shared: None,
                    tenant: None,
                },
                current.last_seen,
            )
            .unwrap()
    }

    /// A one-hour lecture starting at `start` with the given sources.
    pub fn new_stream(start: DateTime<Utc>, variants: &[SourceVariant]) -> NewStream {
        NewStream {
            course_slug: "eidi".to_string(),
            name: "Einführung in die Informatik".to_string(),
            tenant: None,
            start,
            end: start + Duration::hours(1),
            publish_live: true,
            publish_vod: true,
            sources: variants
                .iter()
                .map(|variant| StreamSource {
                    variant: *variant,
                    url: format!("rtsp://cam.example/{}", variant),
                })
                .collect(),
            premiere_file: None,
        }
    }
}

//! Common test utilities for in-process API testing with mocks.
//!
//! This module provides a test fixture that builds the router with both
//! roles wired to in-memory stores and mock collaborators, so the HTTP
//! surface can be exercised without ffmpeg, SQLite files or peers.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use castfleet_core::{
    load_config_from_str,
    scheduler::{CoordinatorConfig, CoordinatorService, HallHook, Scheduler},
    status::{StatusReporter, WorkerIdentity},
    testing::{
        MockCoordinatorClient, MockEncoder, MockHallHook, MockPublisher, MockWorkerClient,
    },
    worker::{PipelineEngine, Publisher},
    DeletionQueue, SqliteRegistry, SqliteStreamStore,
};
use castfleet_server::{create_router, AppState, CoordinatorHandle};

/// Re-export fixtures for test convenience
pub use castfleet_core::testing::fixtures;

/// Identity of the in-process worker
pub const WORKER_ID: &str = "w1";

/// Test fixture for API testing with mock dependencies.
///
/// Provides an in-process server with:
/// - The coordinator role on in-memory registries, calling workers through
///   `MockWorkerClient`
/// - The worker role on `MockEncoder`, reporting to `MockCoordinatorClient`
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health() {
///     let fixture = TestFixture::new().await;
///     let response = fixture.get("/api/v1/health").await;
///     assert_eq!(response.status, 200);
/// }
/// ```
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    pub registry: Option<Arc<SqliteRegistry>>,
    pub streams: Option<Arc<SqliteStreamStore>>,
    /// Records coordinator -> worker calls
    pub worker_client: Arc<MockWorkerClient>,
    /// Records worker -> coordinator calls
    pub coordinator_client: Arc<MockCoordinatorClient>,
    pub encoder: Arc<MockEncoder>,
    pub hall_hook: Arc<MockHallHook>,
    pub engine: Option<Arc<PipelineEngine>>,
    /// Temporary directory for worker storage
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

/// Which roles the fixture enables.
#[derive(Debug, Clone, Copy)]
pub struct TestConfig {
    pub coordinator: bool,
    pub worker: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            coordinator: true,
            worker: true,
        }
    }
}

impl TestConfig {
    pub fn worker_only() -> Self {
        Self {
            coordinator: false,
            worker: true,
        }
    }

    pub fn coordinator_only() -> Self {
        Self {
            coordinator: true,
            worker: false,
        }
    }
}

impl TestFixture {
    /// Create a fixture running both roles.
    pub async fn new() -> Self {
        Self::with_config(TestConfig::default()).await
    }

    pub async fn with_config(test_config: TestConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let mut config = load_config_from_str(
            r#"
[server]
host = "127.0.0.1"
port = 8080
"#,
        )
        .expect("Failed to parse test config");

        let worker_client = Arc::new(MockWorkerClient::new());
        let coordinator_client = Arc::new(MockCoordinatorClient::new());
        let encoder = Arc::new(MockEncoder::new());
        let hall_hook = Arc::new(MockHallHook::new());

        let mut registry = None;
        let mut streams = None;
        let mut coordinator = None;
        if test_config.coordinator {
            let coordinator_config = CoordinatorConfig {
                health_check_enabled: false,
                ..Default::default()
            };
            config.coordinator = Some(coordinator_config.clone());

            let reg = Arc::new(SqliteRegistry::in_memory().expect("Failed to create registry"));
            let store =
                Arc::new(SqliteStreamStore::in_memory().expect("Failed to create stream store"));
            let scheduler = Arc::new(Scheduler::new(
                coordinator_config.clone(),
                reg.clone(),
                reg.clone(),
                store.clone(),
                worker_client.clone(),
            ));
            let service = Arc::new(CoordinatorService::new(
                coordinator_config,
                reg.clone(),
                reg.clone(),
                store.clone(),
                Some(Arc::clone(&hall_hook) as Arc<dyn HallHook>),
            ));
            coordinator = Some(CoordinatorHandle {
                scheduler,
                service,
                workers: reg.clone(),
                slots: reg.clone(),
                streams: store.clone(),
            });
            registry = Some(reg);
            streams = Some(store);
        }

        let mut engine = None;
        if test_config.worker {
            let worker_config = fixtures::worker_config(WORKER_ID, temp_dir.path());
            config.worker = Some(worker_config.clone());

            let status = Arc::new(StatusReporter::new(
                WorkerIdentity {
                    id: worker_config.id.clone(),
                    address: worker_config.address.clone(),
                    version: "test".to_string(),
                    tenant: None,
                    shared: true,
                },
                coordinator_client.clone(),
            ));
            let deletion = Arc::new(
                DeletionQueue::load(
                    worker_config.deletion_queue_file.clone(),
                    chrono::Duration::hours(24),
                )
                .await
                .expect("Failed to load deletion queue"),
            );
            engine = Some(Arc::new(PipelineEngine::new(
                worker_config,
                encoder.clone(),
                Some(Arc::new(MockPublisher::new()) as Arc<dyn Publisher>),
                coordinator_client.clone(),
                status,
                deletion,
            )));
        }

        let mut state = AppState::new(config);
        if let Some(handle) = coordinator {
            state = state.with_coordinator(handle);
        }
        if let Some(ref engine) = engine {
            state = state.with_worker(Arc::clone(engine));
        }
        let router = create_router(Arc::new(state));

        Self {
            router,
            registry,
            streams,
            worker_client,
            coordinator_client,
            encoder,
            hall_hook,
            engine,
            temp_dir,
        }
    }

    pub fn registry(&self) -> &Arc<SqliteRegistry> {
        self.registry.as_ref().expect("coordinator role not enabled")
    }

    pub fn streams(&self) -> &Arc<SqliteStreamStore> {
        self.streams.as_ref().expect("coordinator role not enabled")
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    /// Send a GET request and return the raw text body.
    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    /// Send a request to the test server.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status,
            $response.status,
            serde_json::to_string_pretty(&$response.body).unwrap_or_default()
        );
    };
}

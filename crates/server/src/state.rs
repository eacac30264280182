use std::sync::Arc;

use castfleet_core::{
    registry::{IngestStore, WorkerStore},
    Config, CoordinatorService, PipelineEngine, SanitizedConfig, Scheduler, StreamStore,
};

/// Everything the coordinator role needs to serve requests.
pub struct CoordinatorHandle {
    pub scheduler: Arc<Scheduler>,
    pub service: Arc<CoordinatorService>,
    pub workers: Arc<dyn WorkerStore>,
    pub slots: Arc<dyn IngestStore>,
    pub streams: Arc<dyn StreamStore>,
}

/// Shared application state
///
/// Either role may be absent; its routes then answer 503.
pub struct AppState {
    config: Config,
    coordinator: Option<CoordinatorHandle>,
    worker: Option<Arc<PipelineEngine>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            coordinator: None,
            worker: None,
        }
    }

    pub fn with_coordinator(mut self, coordinator: CoordinatorHandle) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_worker(mut self, engine: Arc<PipelineEngine>) -> Self {
        self.worker = Some(engine);
        self
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn coordinator(&self) -> Option<&CoordinatorHandle> {
        self.coordinator.as_ref()
    }

    pub fn worker(&self) -> Option<&Arc<PipelineEngine>> {
        self.worker.as_ref()
    }
}

pub mod config;
pub mod deletion;
pub mod metrics;
pub mod registry;
pub mod rpc;
pub mod scheduler;
pub mod silence;
pub mod status;
pub mod streams;
pub mod testing;
pub mod worker;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, LogFormat,
    SanitizedConfig,
};
pub use deletion::{DeletionQueue, DeletionQueueError};
pub use registry::{
    IngestSlot, IngestStore, SlotPreference, SqliteRegistry, StoreError, Worker, WorkerStore,
};
pub use rpc::{CoordinatorClient, HttpCoordinatorClient, HttpWorkerClient, RpcError, WorkerClient};
pub use scheduler::{
    CoordinatorConfig, CoordinatorService, HallHook, HttpHallHook, PassReport, Scheduler,
    SchedulerError, SchedulerRunner,
};
pub use status::{HostStatsSampler, StatusReporter, WorkerIdentity};
pub use streams::{SourceVariant, SqliteStreamStore, Stream, StreamStore};
pub use worker::{
    Encoder, FfmpegEncoder, HttpPublisher, PipelineEngine, PipelineError, Publisher,
    WorkerConfig,
};

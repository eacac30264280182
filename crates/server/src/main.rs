use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use castfleet_core::{
    load_config, validate_config, Config, CoordinatorClient, CoordinatorConfig,
    CoordinatorService, DeletionQueue, FfmpegEncoder, HallHook, HostStatsSampler,
    HttpCoordinatorClient, HttpHallHook, HttpPublisher, HttpWorkerClient, LogFormat,
    PipelineEngine, Publisher, Scheduler, SchedulerRunner, SqliteRegistry, SqliteStreamStore,
    StatusReporter, WorkerConfig, WorkerIdentity,
};
use castfleet_server::{create_router, AppState, CoordinatorHandle};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound on waiting for cancelled pipelines during shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(format: LogFormat) {
    let json = format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Coordinator components kept for shutdown
struct CoordinatorRole {
    handle: CoordinatorHandle,
    runner: SchedulerRunner,
}

fn start_coordinator(config: &CoordinatorConfig, db_path: &Path) -> Result<CoordinatorRole> {
    let registry = Arc::new(
        SqliteRegistry::new(db_path).context("Failed to open worker and ingest registry")?,
    );
    let streams =
        Arc::new(SqliteStreamStore::new(db_path).context("Failed to open stream store")?);
    info!("Registries initialized at {:?}", db_path);

    let client = Arc::new(
        HttpWorkerClient::new(
            Duration::from_secs(config.rpc_deadline_secs),
            Duration::from_secs(config.job_rpc_deadline_secs),
        )
        .context("Failed to create worker RPC client")?,
    );

    let hall_hook: Option<Arc<dyn HallHook>> = match &config.hall_hook_url {
        Some(url) => {
            info!("Lecture-hall hook enabled at {}", url);
            Some(Arc::new(
                HttpHallHook::new(url.clone()).context("Failed to create hall hook client")?,
            ))
        }
        None => None,
    };

    let scheduler = Arc::new(Scheduler::new(
        config.clone(),
        registry.clone(),
        registry.clone(),
        streams.clone(),
        client,
    ));
    let service = Arc::new(CoordinatorService::new(
        config.clone(),
        registry.clone(),
        registry.clone(),
        streams.clone(),
        hall_hook,
    ));

    let runner = SchedulerRunner::new(Arc::clone(&scheduler));
    runner.start();
    info!("Scheduler started");

    Ok(CoordinatorRole {
        handle: CoordinatorHandle {
            scheduler,
            service,
            workers: registry.clone(),
            slots: registry,
            streams,
        },
        runner,
    })
}

async fn start_worker(
    config: &WorkerConfig,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<Arc<PipelineEngine>> {
    let client: Arc<dyn CoordinatorClient> = Arc::new(
        HttpCoordinatorClient::new(
            config.coordinator_url.clone(),
            Duration::from_secs(config.rpc_deadline_secs),
        )
        .context("Failed to create coordinator RPC client")?,
    );

    let publisher: Option<Arc<dyn Publisher>> = match &config.publish_url {
        Some(url) => {
            info!("Publishing VODs to {}", url);
            Some(Arc::new(
                HttpPublisher::new(url.clone(), config.publish_token.clone())
                    .context("Failed to create VOD publisher")?,
            ))
        }
        None => {
            info!("No publish endpoint configured, VOD publishing is skipped");
            None
        }
    };

    let status = Arc::new(StatusReporter::new(
        WorkerIdentity {
            id: config.id.clone(),
            address: config.address.clone(),
            version: config.version.clone(),
            tenant: config.tenant.clone(),
            shared: config.shared,
        },
        Arc::clone(&client),
    ));

    let deletion = Arc::new(
        DeletionQueue::load(
            config.deletion_queue_file.clone(),
            chrono::Duration::hours(config.deletion_retention_hours),
        )
        .await
        .with_context(|| {
            format!(
                "Failed to load deletion queue from {:?}",
                config.deletion_queue_file
            )
        })?,
    );

    let engine = Arc::new(PipelineEngine::new(
        config.clone(),
        Arc::new(FfmpegEncoder::new(config.encoder.clone())),
        publisher,
        client,
        Arc::clone(&status),
        Arc::clone(&deletion),
    ));

    Arc::clone(&status).spawn_heartbeat_loop(
        Duration::from_secs(config.heartbeat_interval_secs),
        shutdown_tx.subscribe(),
    );
    HostStatsSampler::new(config.recording_dir.clone()).spawn(
        Arc::clone(&status),
        Duration::from_secs(config.stats_interval_secs),
        shutdown_tx.subscribe(),
    );
    deletion.spawn_sweeper(
        Duration::from_secs(config.deletion_sweep_interval_secs),
        shutdown_tx.subscribe(),
    );
    info!(worker_id = %config.id, "Worker pipeline started");

    Ok(engine)
}

async fn run() -> Result<()> {
    // Determine config path
    let config_path = std::env::var("CASTFLEET_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Logging follows the config, so load it first
    let loaded = load_config(&config_path);
    init_logging(
        loaded
            .as_ref()
            .map(|c| c.logging.format)
            .unwrap_or_default(),
    );
    let config: Config =
        loaded.with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        version = VERSION,
        config_hash = &config_hash[..16],
        coordinator = config.coordinator.is_some(),
        worker = config.worker.is_some(),
        "Configuration loaded from {:?}",
        config_path
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut state = AppState::new(config.clone());

    let coordinator = match &config.coordinator {
        Some(c) => Some(start_coordinator(c, &config.database.path)?),
        None => None,
    };
    let mut runner = None;
    let mut service = None;
    if let Some(role) = coordinator {
        service = Some(Arc::clone(&role.handle.service));
        runner = Some(role.runner);
        state = state.with_coordinator(role.handle);
    }

    let engine = match &config.worker {
        Some(w) => Some(start_worker(w, &shutdown_tx).await?),
        None => None,
    };
    if let Some(ref engine) = engine {
        state = state.with_worker(Arc::clone(engine));
    }

    let app = create_router(Arc::new(state));

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Register once the listener is up; a co-located coordinator answers on it
    if let Some(ref engine) = engine {
        let status = Arc::clone(engine.status_reporter());
        tokio::spawn(async move {
            match status.register().await {
                Ok(()) => info!("Registered with coordinator"),
                Err(e) => warn!(error = %e, "Registration failed, heartbeats will register"),
            }
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");

    if let Some(ref runner) = runner {
        runner.stop();
    }
    if let Some(ref service) = service {
        service.shutdown();
    }

    if let Some(ref engine) = engine {
        engine.drain().await;
        if tokio::time::timeout(DRAIN_TIMEOUT, engine.wait_idle())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "Pipelines still running at shutdown"
            );
        }
    }

    // Stop heartbeat, stats and deletion loops
    let _ = shutdown_tx.send(());
    info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::rpc::{CoordinatorClient, HeartbeatRequest, HostStats, RegisterRequest, RpcError};

/// Who this worker is, as reported to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerIdentity {
    pub id: String,
    pub address: String,
    pub version: String,
    pub tenant: Option<String>,
    pub shared: bool,
}

/// Token for a job recorded in the status ledger.
#[derive(Debug)]
#[must_use = "pass the handle to StatusReporter::end_job when the job ends"]
pub struct JobHandle {
    id: u64,
    cost: i64,
}

#[derive(Debug, Default)]
struct Ledger {
    workload: i64,
    jobs: Vec<(u64, String, i64)>,
    next_id: u64,
}

/// Point-in-time copy of the worker status.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub workload: i64,
    pub jobs: Vec<String>,
    pub stats: HostStats,
}

/// Tracks workload and running jobs, and pushes heartbeats.
///
/// Workload and the job list change together under one lock. The lock is
/// only held for the mutation itself, never across a subprocess or an RPC.
pub struct StatusReporter {
    identity: WorkerIdentity,
    ledger: Mutex<Ledger>,
    stats: Mutex<HostStats>,
    client: Arc<dyn CoordinatorClient>,
}

impl StatusReporter {
    pub fn new(identity: WorkerIdentity, client: Arc<dyn CoordinatorClient>) -> Self {
        Self {
            identity,
            ledger: Mutex::new(Ledger::default()),
            stats: Mutex::new(HostStats::default()),
            client,
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        // A panic mid-mutation leaves at worst a stale entry, keep going
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a job start and push a heartbeat.
    pub async fn begin_job(&self, description: impl Into<String>, cost: i64) -> JobHandle {
        let description = description.into();
        let handle = {
            let mut ledger = self.ledger();
            let id = ledger.next_id;
            ledger.next_id += 1;
            ledger.workload += cost;
            ledger.jobs.push((id, description.clone(), cost));
            JobHandle { id, cost }
        };
        debug!(job = %description, cost, "Job started");
        self.push_heartbeat_logged().await;
        handle
    }

    /// Record a job end and push a heartbeat.
    pub async fn end_job(&self, handle: JobHandle) {
        {
            let mut ledger = self.ledger();
            if let Some(pos) = ledger.jobs.iter().position(|(id, _, _)| *id == handle.id) {
                ledger.jobs.remove(pos);
                ledger.workload -= handle.cost;
            }
        }
        self.push_heartbeat_logged().await;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (workload, jobs) = {
            let ledger = self.ledger();
            (
                ledger.workload,
                ledger.jobs.iter().map(|(_, d, _)| d.clone()).collect(),
            )
        };
        StatusSnapshot {
            workload,
            jobs,
            stats: self.stats(),
        }
    }

    pub fn stats(&self) -> HostStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_stats(&self, stats: HostStats) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = stats;
    }

    pub fn heartbeat_request(&self) -> HeartbeatRequest {
        let snapshot = self.snapshot();
        HeartbeatRequest {
            worker_id: self.identity.id.clone(),
            address: self.identity.address.clone(),
            workload: snapshot.workload,
            jobs: snapshot.jobs,
            version: self.identity.version.clone(),
            stats: snapshot.stats,
            tenant: self.identity.tenant.clone(),
            shared: Some(self.identity.shared),
        }
    }

    pub async fn push_heartbeat(&self) -> Result<(), RpcError> {
        let request = self.heartbeat_request();
        self.client.heartbeat(&request).await
    }

    async fn push_heartbeat_logged(&self) {
        if let Err(e) = self.push_heartbeat().await {
            warn!(error = %e, "Heartbeat failed");
        }
    }

    /// Announce this worker to the coordinator.
    pub async fn register(&self) -> Result<(), RpcError> {
        self.client
            .register(&RegisterRequest {
                worker_id: self.identity.id.clone(),
                address: self.identity.address.clone(),
                tenant: self.identity.tenant.clone(),
                shared: self.identity.shared,
                version: Some(self.identity.version.clone()),
            })
            .await
    }

    /// Push a heartbeat every `interval` until shutdown.
    pub fn spawn_heartbeat_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Heartbeat loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Heartbeat loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        self.push_heartbeat_logged().await;
                    }
                }
            }
        })
    }
}

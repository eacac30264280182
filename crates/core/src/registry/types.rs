//! Types for worker and ingest-slot records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::rpc::HostStats;

/// A worker is considered alive if it heartbeated within this window.
pub const LIVENESS_WINDOW: Duration = Duration::minutes(5);

/// A worker registered with the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Identity token. Doubles as the worker's shared secret.
    pub id: String,
    /// Base URL the coordinator uses to reach the worker's RPC surface.
    pub address: String,
    /// Sum of the costs of the jobs the coordinator believes are running.
    pub workload: i64,
    pub last_seen: DateTime<Utc>,
    /// Owning tenant. `None` together with `shared = false` means the worker
    /// only takes tenant-less streams.
    pub tenant: Option<String>,
    pub shared: bool,
    pub version: Option<String>,
    /// Free-text job descriptions from the last heartbeat.
    pub jobs: Vec<String>,
    pub stats: Option<HostStats>,
}

impl Worker {
    /// Whether the worker heartbeated within `window` of `now`.
    pub fn is_alive_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now.signed_duration_since(self.last_seen) < window
    }

    /// Whether this worker may take work for the given tenant.
    pub fn serves_tenant(&self, tenant: Option<&str>) -> bool {
        self.shared || self.tenant.as_deref() == tenant
    }

    /// Whether the last heartbeat lists a job naming `needle` as a whole word.
    pub fn reports_job(&self, needle: &str) -> bool {
        self.jobs
            .iter()
            .any(|job| job.split_whitespace().any(|word| word == needle))
    }
}

/// Registration payload accepted by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRegistration {
    pub id: String,
    pub address: String,
    pub tenant: Option<String>,
    pub shared: bool,
    pub version: Option<String>,
}

/// Heartbeat payload accepted by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHeartbeat {
    pub id: String,
    pub address: String,
    pub workload: i64,
    pub jobs: Vec<String>,
    pub version: Option<String>,
    pub stats: Option<HostStats>,
    /// Placement reported by the worker. `None` leaves the stored tenant
    /// and shared flag untouched.
    pub shared: Option<bool>,
    pub tenant: Option<String>,
}

/// An ingest server that accepts pushed live streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestServer {
    pub id: i64,
    /// Push base URL, e.g. `rtmp://ingest-1.example.org/live`.
    pub url: String,
}

/// A named ingest slot on an ingest server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestSlot {
    pub id: i64,
    /// Stream key, unique across all servers.
    pub name: String,
    pub server_id: i64,
    pub server_url: String,
    /// Whether the ingest server transcodes pushes into this slot.
    pub transcoding: bool,
    /// Stream currently bound to the slot. `None` means free.
    pub stream_id: Option<i64>,
    /// When the slot was last released.
    pub freed_at: Option<DateTime<Utc>>,
}

impl IngestSlot {
    pub fn is_free(&self) -> bool {
        self.stream_id.is_none()
    }

    /// Full push URL for this slot.
    pub fn push_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.name)
    }
}

/// Which kind of slot a claim should look for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPreference {
    /// Only plain slots.
    Plain,
    /// Transcoding slots first, then plain ones.
    PreferTranscoding,
}

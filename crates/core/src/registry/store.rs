//! Registry store traits.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::{
    IngestServer, IngestSlot, SlotPreference, Worker, WorkerHeartbeat, WorkerRegistration,
};

/// Errors from registry and stream store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persistence for the worker registry.
///
/// Implementations must make individual operations atomic; workload
/// adjustments from concurrent callers never lose updates.
pub trait WorkerStore: Send + Sync {
    /// Insert or update a worker's registration data.
    fn register(&self, registration: &WorkerRegistration, now: DateTime<Utc>)
        -> Result<Worker, StoreError>;

    /// Record a heartbeat. Unknown workers are registered on the fly with
    /// no tenant and `shared = false`.
    fn record_heartbeat(
        &self,
        heartbeat: &WorkerHeartbeat,
        now: DateTime<Utc>,
    ) -> Result<Worker, StoreError>;

    fn get(&self, id: &str) -> Result<Option<Worker>, StoreError>;

    /// All workers in registration order.
    fn list(&self) -> Result<Vec<Worker>, StoreError>;

    /// Add `delta` to a worker's workload and return the new value.
    fn adjust_workload(&self, id: &str, delta: i64) -> Result<i64, StoreError>;
}

/// Persistence for ingest servers and their slots.
pub trait IngestStore: Send + Sync {
    fn add_server(&self, url: &str) -> Result<IngestServer, StoreError>;

    fn add_slot(
        &self,
        server_id: i64,
        name: &str,
        transcoding: bool,
    ) -> Result<IngestSlot, StoreError>;

    /// Atomically bind one free slot to `stream_id`.
    ///
    /// Returns `None` if no matching slot is free. A slot is never handed
    /// to two concurrent callers.
    fn claim_slot(
        &self,
        stream_id: i64,
        preference: SlotPreference,
    ) -> Result<Option<IngestSlot>, StoreError>;

    /// Free a slot by name. Returns whether it was bound.
    fn release_slot(&self, name: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Free a slot only while it is still bound to `stream_id`.
    fn release_slot_of(
        &self,
        name: &str,
        stream_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    fn get_slot(&self, name: &str) -> Result<Option<IngestSlot>, StoreError>;

    fn list_slots(&self) -> Result<Vec<IngestSlot>, StoreError>;
}

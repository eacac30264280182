//! Worker registry and ingest slot registry.
//!
//! The coordinator's view of its fleet: which workers exist, how loaded
//! they are, when they last checked in, and which ingest slots are bound
//! to which streams.

mod sqlite;
mod store;
mod types;

pub use sqlite::SqliteRegistry;
pub use store::{IngestStore, StoreError, WorkerStore};
pub use types::{
    IngestServer, IngestSlot, SlotPreference, Worker, WorkerHeartbeat, WorkerRegistration,
    LIVENESS_WINDOW,
};

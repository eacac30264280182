//! Durable deletion queue.
//!
//! Raw recordings are not deleted right after transcoding. They are moved
//! to a trash directory and recorded here, and an hourly sweep deletes
//! files that have been marked for at least the retention period. The
//! queue is persisted to a JSON file on every change and reloaded at
//! startup, so a restart never forgets a pending deletion.

mod queue;

pub use queue::{DeletionQueue, DeletionQueueError, DeletionRecord, SweepReport};

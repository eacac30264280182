//! Types for the scheduler and coordinator service.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::StoreError;
use crate::rpc::{RpcError, IDENTITY_MISMATCH};

/// Errors from coordinator-side operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("stream not found: {0}")]
    StreamNotFound(i64),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    /// No alive worker serves the tenant.
    #[error("no eligible worker")]
    NoEligibleWorker,

    /// A notification came from a worker the registry does not know.
    #[error("identity mismatch")]
    IdentityMismatch,

    #[error("malformed request: {0}")]
    Malformed(String),
}

impl SchedulerError {
    /// Reason string sent back over RPC.
    pub fn rejection_reason(&self) -> String {
        match self {
            SchedulerError::IdentityMismatch => IDENTITY_MISMATCH.to_string(),
            other => other.to_string(),
        }
    }
}

/// Result of handing one job to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Accepted { worker_id: String, slot_name: String },
    /// The worker answered not-ok, or could not be reached.
    Rejected { worker_id: String, reason: String },
    /// No free ingest slot.
    NoSlot,
    /// No alive worker serves the stream's tenant.
    NoWorker,
}

/// What one dispatch pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub due_streams: usize,
    pub due_premieres: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub skipped_no_slot: usize,
    pub skipped_no_worker: usize,
    /// The pass found due work but no alive worker and dispatched nothing.
    pub aborted: bool,
}

impl PassReport {
    pub(super) fn record(&mut self, result: &DispatchResult) {
        match result {
            DispatchResult::Accepted { .. } => self.accepted += 1,
            DispatchResult::Rejected { .. } => self.rejected += 1,
            DispatchResult::NoSlot => self.skipped_no_slot += 1,
            DispatchResult::NoWorker => self.skipped_no_worker += 1,
        }
    }
}

/// What a stop request did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    /// Assignments the workers reported as cancelled.
    pub cancelled: usize,
    /// Cancel calls that failed.
    pub failed: usize,
    /// Slots of the stream that no alive worker reports.
    pub unmatched: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_report_record() {
        let mut report = PassReport::default();
        report.record(&DispatchResult::Accepted {
            worker_id: "w1".to_string(),
            slot_name: "s1".to_string(),
        });
        report.record(&DispatchResult::NoSlot);
        report.record(&DispatchResult::NoSlot);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.skipped_no_slot, 2);
        assert!(!report.aborted);
    }

    #[test]
    fn test_identity_mismatch_reason() {
        assert_eq!(
            SchedulerError::IdentityMismatch.rejection_reason(),
            "identity mismatch"
        );
    }
}

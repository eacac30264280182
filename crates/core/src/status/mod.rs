//! Worker status: workload, running jobs, host stats and heartbeats.

mod reporter;
mod stats;

pub use reporter::{JobHandle, StatusReporter, StatusSnapshot, WorkerIdentity};
pub use stats::HostStatsSampler;

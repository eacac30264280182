//! Coordinator configuration.

use serde::{Deserialize, Serialize};

use crate::streams::SourceVariant;

/// Configuration for the coordinator role (`[coordinator]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How often a dispatch pass runs (seconds).
    pub dispatch_interval_secs: u64,

    /// Streams starting within this window are dispatched (minutes).
    pub lookahead_mins: i64,

    /// Workers not seen within this window are not eligible (seconds).
    pub liveness_window_secs: i64,

    /// Source variants dispatched for each stream, in dispatch order.
    pub source_variants: Vec<SourceVariant>,

    /// Time after a stream finishes before its slot is freed (seconds).
    pub slot_cooldown_secs: u64,

    /// Deadline for assignment and cancellation calls (seconds).
    pub rpc_deadline_secs: u64,

    /// Deadline for ad-hoc job calls such as thumbnails (seconds).
    pub job_rpc_deadline_secs: u64,

    /// Probe the live URL after a stream starts.
    pub health_check_enabled: bool,

    /// Delay before the post-start health check (seconds).
    pub health_check_delay_secs: u64,

    /// Lecture-hall hook endpoint, called on stream start and finish.
    pub hall_hook_url: Option<String>,

    /// How often bound slots are checked against worker reports (seconds).
    pub reconcile_interval_secs: u64,

    /// How often slots past their cooldown are released (seconds).
    pub release_sweep_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: 60,
            lookahead_mins: 10,
            liveness_window_secs: 300, // 5 minutes
            source_variants: SourceVariant::all().to_vec(),
            slot_cooldown_secs: 7200, // 2 hours
            rpc_deadline_secs: 5,
            job_rpc_deadline_secs: 120,
            health_check_enabled: true,
            health_check_delay_secs: 30,
            hall_hook_url: None,
            reconcile_interval_secs: 300,
            release_sweep_interval_secs: 600,
        }
    }
}

impl CoordinatorConfig {
    pub fn lookahead(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lookahead_mins)
    }

    pub fn liveness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.liveness_window_secs)
    }

    pub fn slot_cooldown(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.slot_cooldown_secs)
    }
}

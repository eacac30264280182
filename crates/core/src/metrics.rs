//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Scheduler (dispatch passes, assignments, slot bookkeeping)
//! - Worker pipeline (stages, capture retries)
//! - Deletion queue

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Scheduler
// =============================================================================

/// Dispatch passes by outcome.
pub static DISPATCH_PASSES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("castfleet_dispatch_passes_total", "Total dispatch passes"),
        &["result"], // "completed", "aborted_no_workers", "failed"
    )
    .unwrap()
});

/// Assignment attempts by job kind and result.
pub static ASSIGNMENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "castfleet_assignments_total",
            "Assignments handed to workers",
        ),
        &["kind", "result"], // result: "accepted", "rejected", "unreachable", "error", "unrecorded"
    )
    .unwrap()
});

/// Streams skipped during a pass by reason.
pub static STREAMS_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "castfleet_streams_skipped_total",
            "Stream sources skipped during dispatch",
        ),
        &["reason"], // "no_slot", "no_eligible_worker"
    )
    .unwrap()
});

/// Slots released after the cooldown.
pub static SLOTS_RELEASED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "castfleet_slots_released_total",
        "Ingest slots released after cooldown",
    )
    .unwrap()
});

/// Bound slots whose stream no alive worker reports.
pub static ORPHANED_SLOTS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "castfleet_orphaned_slots",
        "Bound ingest slots not reported by any alive worker",
    )
    .unwrap()
});

/// Detached coordinator tasks (health checks, hall hooks) that failed.
pub static SIDE_TASK_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "castfleet_side_task_failures_total",
            "Detached coordinator tasks that failed",
        ),
        &["task"],
    )
    .unwrap()
});

// =============================================================================
// Worker pipeline
// =============================================================================

/// Pipeline stages by stage and result.
pub static STAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("castfleet_pipeline_stages_total", "Pipeline stages run"),
        &["stage", "result"], // result: "ok", "failed", "cancelled"
    )
    .unwrap()
});

/// Stage duration in seconds.
pub static STAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "castfleet_pipeline_stage_duration_seconds",
            "Duration of pipeline stages",
        )
        .buckets(vec![1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
        &["stage"],
    )
    .unwrap()
});

/// Capture process restarts.
pub static CAPTURE_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "castfleet_capture_retries_total",
        "Capture subprocess restarts",
    )
    .unwrap()
});

/// Active assignments on this worker.
pub static ACTIVE_ASSIGNMENTS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "castfleet_active_assignments",
        "Assignments currently running on this worker",
    )
    .unwrap()
});

// =============================================================================
// Deletion queue
// =============================================================================

pub static DELETION_QUEUE_PENDING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "castfleet_deletion_queue_pending",
        "Files waiting in the deletion queue",
    )
    .unwrap()
});

pub static FILES_DELETED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "castfleet_files_deleted_total",
        "Files removed by the deletion sweep",
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Scheduler
        Box::new(DISPATCH_PASSES.clone()),
        Box::new(ASSIGNMENTS.clone()),
        Box::new(STREAMS_SKIPPED.clone()),
        Box::new(SLOTS_RELEASED.clone()),
        Box::new(ORPHANED_SLOTS.clone()),
        Box::new(SIDE_TASK_FAILURES.clone()),
        // Pipeline
        Box::new(STAGES.clone()),
        Box::new(STAGE_DURATION.clone()),
        Box::new(CAPTURE_RETRIES.clone()),
        Box::new(ACTIVE_ASSIGNMENTS.clone()),
        // Deletion queue
        Box::new(DELETION_QUEUE_PENDING.clone()),
        Box::new(FILES_DELETED_TOTAL.clone()),
    ]
}

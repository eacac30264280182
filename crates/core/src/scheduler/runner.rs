//! Periodic coordinator loops: dispatch, slot release and reconciliation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::dispatch::Scheduler;

/// Drives a [`Scheduler`] on fixed intervals.
pub struct SchedulerRunner {
    scheduler: Arc<Scheduler>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl SchedulerRunner {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            scheduler,
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the background loops.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler runner already running");
            return;
        }
        let config = self.scheduler.config();
        info!(
            dispatch_interval_secs = config.dispatch_interval_secs,
            "Starting scheduler loops"
        );
        self.spawn_dispatch_loop(Duration::from_secs(config.dispatch_interval_secs));
        self.spawn_release_loop(Duration::from_secs(config.release_sweep_interval_secs));
        self.spawn_reconcile_loop(Duration::from_secs(config.reconcile_interval_secs));
    }

    /// Signal every loop to stop.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping scheduler loops");
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_dispatch_loop(&self, interval: Duration) {
        let scheduler = Arc::clone(&self.scheduler);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!("Dispatch loop started");
            loop {
                if let Err(e) = scheduler.run_pass(Utc::now()).await {
                    error!(error = %e, "Dispatch pass failed");
                }
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Dispatch loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    fn spawn_release_loop(&self, interval: Duration) {
        let scheduler = Arc::clone(&self.scheduler);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!("Slot release loop started");
            loop {
                if let Err(e) = scheduler.release_expired_slots(Utc::now()) {
                    error!(error = %e, "Slot release sweep failed");
                }
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Slot release loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    fn spawn_reconcile_loop(&self, interval: Duration) {
        let scheduler = Arc::clone(&self.scheduler);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!("Reconcile loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Reconcile loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = scheduler.find_orphaned_slots(Utc::now()).await {
                            error!(error = %e, "Orphan scan failed");
                        }
                    }
                }
            }
        });
    }
}

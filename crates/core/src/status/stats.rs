//! Host utilization sampling from procfs and statvfs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::reporter::StatusReporter;
use crate::rpc::HostStats;

/// Cumulative CPU jiffies from `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Samples CPU, memory and disk utilization.
pub struct HostStatsSampler {
    disk_path: PathBuf,
    started: Instant,
    prev_cpu: Option<CpuTimes>,
}

impl HostStatsSampler {
    /// `disk_path` is the filesystem whose usage gets reported.
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
            started: Instant::now(),
            prev_cpu: None,
        }
    }

    /// Take a sample. CPU usage is measured since the previous sample, so
    /// the first call reports 0.
    pub async fn sample(&mut self) -> HostStats {
        let cpu_now = tokio::fs::read_to_string("/proc/stat")
            .await
            .ok()
            .and_then(|s| parse_proc_stat(&s));
        let cpu_percent = match (self.prev_cpu, cpu_now) {
            (Some(prev), Some(now)) => cpu_usage(prev, now),
            _ => 0.0,
        };
        if cpu_now.is_some() {
            self.prev_cpu = cpu_now;
        }

        let memory_percent = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .and_then(|s| parse_meminfo(&s))
            .unwrap_or(0.0);

        let disk_path = self.disk_path.clone();
        let disk_percent = tokio::task::spawn_blocking(move || disk_usage(&disk_path))
            .await
            .ok()
            .flatten()
            .unwrap_or(0.0);

        HostStats {
            cpu_percent,
            memory_percent,
            disk_percent,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    /// Refresh the reporter's stats every `interval` until shutdown.
    pub fn spawn(
        mut self,
        reporter: Arc<StatusReporter>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Host stats sampler started");
            // Prime the CPU counters
            reporter.set_stats(self.sample().await);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Host stats sampler received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let stats = self.sample().await;
                        debug!(?stats, "Sampled host stats");
                        reporter.set_stats(stats);
                    }
                }
            }
        })
    }
}

fn parse_proc_stat(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    // user nice system idle iowait irq softirq steal ...
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total: u64 = values.iter().take(8).sum();
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn cpu_usage(prev: CpuTimes, now: CpuTimes) -> f32 {
    let total = now.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let busy = now.busy.saturating_sub(prev.busy);
    (busy as f64 / total as f64 * 100.0) as f32
}

fn parse_meminfo(content: &str) -> Option<f32> {
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse::<u64>().ok()),
            Some("MemAvailable:") => {
                available = parts.next().and_then(|v| v.parse::<u64>().ok())
            }
            _ => {}
        }
    }
    let total = total.filter(|t| *t > 0)?;
    let available = available?;
    Some((total.saturating_sub(available) as f64 / total as f64 * 100.0) as f32)
}

fn disk_usage(path: &std::path::Path) -> Option<f32> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    let total = stat.blocks() as u64;
    if total == 0 {
        return None;
    }
    let available = stat.blocks_available() as u64;
    Some((total.saturating_sub(available) as f64 / total as f64 * 100.0) as f32)
}

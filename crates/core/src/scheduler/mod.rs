//! Coordinator role: dispatch passes, worker notifications and the
//! periodic loops around them.

mod config;
mod dispatch;
mod hooks;
mod runner;
mod service;
mod types;

pub use config::CoordinatorConfig;
pub use dispatch::{select_worker, Scheduler};
pub use hooks::{HallEvent, HallHook, HallNotification, HttpHallHook};
pub use runner::SchedulerRunner;
pub use service::CoordinatorService;
pub use types::{DispatchResult, PassReport, SchedulerError, StopReport};

//! HTTP surface of castfleet.
//!
//! One router serves both roles: the control protocol under `/rpc/...`,
//! the coordinator admin API under `/api/v1/...` and Prometheus metrics
//! under `/metrics`.

pub mod api;
pub mod metrics;
pub mod state;

pub use api::create_router;
pub use state::{AppState, CoordinatorHandle};

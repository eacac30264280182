//! Control protocol between coordinator and workers.
//!
//! Both directions are JSON over HTTP: the coordinator calls
//! `/rpc/worker/*` on workers, workers call `/rpc/coordinator/*` on the
//! coordinator.

mod error;
mod http;
mod traits;
mod types;

pub use error::RpcError;
pub use http::{HttpCoordinatorClient, HttpWorkerClient};
pub use traits::{CoordinatorClient, WorkerClient};
pub use types::*;

//! Mock lecture hall hook.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::rpc::RpcError;
use crate::scheduler::{HallHook, HallNotification};

/// Mock implementation of the HallHook trait.
#[derive(Debug, Default)]
pub struct MockHallHook {
    events: Arc<RwLock<Vec<HallNotification>>>,
    fail: Arc<RwLock<bool>>,
}

impl MockHallHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every notification fail after being recorded.
    pub async fn set_fail(&self, fail: bool) {
        *self.fail.write().await = fail;
    }

    pub async fn events(&self) -> Vec<HallNotification> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl HallHook for MockHallHook {
    async fn notify(&self, notification: &HallNotification) -> Result<(), RpcError> {
        self.events.write().await.push(notification.clone());
        if *self.fail.read().await {
            return Err(RpcError::Transport("hall controller unreachable".to_string()));
        }
        Ok(())
    }
}

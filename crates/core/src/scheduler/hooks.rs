//! Lecture-hall hooks, e.g. switching a "live" light on and off.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::rpc::RpcError;

/// Stream lifecycle event sent to a hall hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HallEvent {
    StreamStarted,
    StreamFinished,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HallNotification {
    pub event: HallEvent,
    pub stream_id: i64,
    pub course_slug: String,
    pub stream_name: String,
}

/// Receives stream start/finish events for the lecture hall.
#[async_trait]
pub trait HallHook: Send + Sync {
    async fn notify(&self, notification: &HallNotification) -> Result<(), RpcError>;
}

/// POSTs hall notifications as JSON to a fixed URL.
pub struct HttpHallHook {
    client: Client,
    url: String,
}

impl HttpHallHook {
    pub fn new(url: impl Into<String>) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HallHook for HttpHallHook {
    async fn notify(&self, notification: &HallNotification) -> Result<(), RpcError> {
        let response = self.client.post(&self.url).json(notification).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RpcError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

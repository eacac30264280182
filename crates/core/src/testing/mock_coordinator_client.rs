//! Mock coordinator client for testing workers.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::rpc::*;

/// A notification a worker sent, in the order it was sent.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedNotification {
    StreamStarted(StreamStartedRequest),
    StreamFinished(StreamFinishedRequest),
    TranscodingFinished(TranscodingFinishedRequest),
    PublishFinished(PublishFinishedRequest),
    SilenceResults(SilenceResultsRequest),
    StageFailed(StageFailedRequest),
}

impl RecordedNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            RecordedNotification::StreamStarted(_) => "stream_started",
            RecordedNotification::StreamFinished(_) => "stream_finished",
            RecordedNotification::TranscodingFinished(_) => "transcoding_finished",
            RecordedNotification::PublishFinished(_) => "publish_finished",
            RecordedNotification::SilenceResults(_) => "silence_results",
            RecordedNotification::StageFailed(_) => "stage_failed",
        }
    }
}

/// Mock implementation of the CoordinatorClient trait.
///
/// Records registrations, heartbeats and notifications. A failure set with
/// [`MockCoordinatorClient::set_next_error`] is returned by the next call
/// of any kind, which is then not recorded.
#[derive(Debug, Default)]
pub struct MockCoordinatorClient {
    registrations: Arc<RwLock<Vec<RegisterRequest>>>,
    heartbeats: Arc<RwLock<Vec<HeartbeatRequest>>>,
    notifications: Arc<RwLock<Vec<RecordedNotification>>>,
    next_error: Arc<RwLock<Option<RpcError>>>,
}

impl MockCoordinatorClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_next_error(&self, error: RpcError) {
        *self.next_error.write().await = Some(error);
    }

    pub async fn registrations(&self) -> Vec<RegisterRequest> {
        self.registrations.read().await.clone()
    }

    pub async fn heartbeats(&self) -> Vec<HeartbeatRequest> {
        self.heartbeats.read().await.clone()
    }

    pub async fn notifications(&self) -> Vec<RecordedNotification> {
        self.notifications.read().await.clone()
    }

    /// Notification kinds in the order they arrived.
    pub async fn notification_kinds(&self) -> Vec<String> {
        self.notifications
            .read()
            .await
            .iter()
            .map(|n| n.kind().to_string())
            .collect()
    }

    pub async fn stream_started(&self) -> Vec<StreamStartedRequest> {
        self.filter(|n| match n {
            RecordedNotification::StreamStarted(r) => Some(r.clone()),
            _ => None,
        })
        .await
    }

    pub async fn silence_results(&self) -> Vec<SilenceResultsRequest> {
        self.filter(|n| match n {
            RecordedNotification::SilenceResults(r) => Some(r.clone()),
            _ => None,
        })
        .await
    }

    pub async fn stage_failures(&self) -> Vec<StageFailedRequest> {
        self.filter(|n| match n {
            RecordedNotification::StageFailed(r) => Some(r.clone()),
            _ => None,
        })
        .await
    }

    async fn filter<T>(&self, f: impl Fn(&RecordedNotification) -> Option<T>) -> Vec<T> {
        self.notifications.read().await.iter().filter_map(f).collect()
    }

    async fn take_error(&self) -> Result<(), RpcError> {
        match self.next_error.write().await.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn record(&self, notification: RecordedNotification) -> Result<(), RpcError> {
        self.take_error().await?;
        self.notifications.write().await.push(notification);
        Ok(())
    }
}

#[async_trait]
impl CoordinatorClient for MockCoordinatorClient {
    async fn register(&self, req: &RegisterRequest) -> Result<(), RpcError> {
        self.take_error().await?;
        self.registrations.write().await.push(req.clone());
        Ok(())
    }

    async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<(), RpcError> {
        self.take_error().await?;
        self.heartbeats.write().await.push(req.clone());
        Ok(())
    }

    async fn stream_started(&self, req: &StreamStartedRequest) -> Result<(), RpcError> {
        self.record(RecordedNotification::StreamStarted(req.clone()))
            .await
    }

    async fn stream_finished(&self, req: &StreamFinishedRequest) -> Result<(), RpcError> {
        self.record(RecordedNotification::StreamFinished(req.clone()))
            .await
    }

    async fn transcoding_finished(
        &self,
        req: &TranscodingFinishedRequest,
    ) -> Result<(), RpcError> {
        self.record(RecordedNotification::TranscodingFinished(req.clone()))
            .await
    }

    async fn publish_finished(&self, req: &PublishFinishedRequest) -> Result<(), RpcError> {
        self.record(RecordedNotification::PublishFinished(req.clone()))
            .await
    }

    async fn silence_results(&self, req: &SilenceResultsRequest) -> Result<(), RpcError> {
        self.record(RecordedNotification::SilenceResults(req.clone()))
            .await
    }

    async fn stage_failed(&self, req: &StageFailedRequest) -> Result<(), RpcError> {
        self.record(RecordedNotification::StageFailed(req.clone()))
            .await
    }
}

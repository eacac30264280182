//! JSON-over-HTTP implementations of the control protocol clients.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::error::RpcError;
use super::traits::{CoordinatorClient, WorkerClient};
use super::types::*;

/// Idle pooled connections are dropped after this long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// TCP keepalive probe interval for long-lived connections.
const TCP_KEEPALIVE: Duration = Duration::from_secs(600);

fn build_client() -> Result<Client, RpcError> {
    Client::builder()
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        .build()
        .map_err(|e| RpcError::Transport(e.to_string()))
}

async fn post_json<Req, Resp>(
    client: &Client,
    url: &str,
    body: &Req,
    deadline: Duration,
) -> Result<Resp, RpcError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    debug!(url = %url, "RPC call");
    let response = client
        .post(url)
        .timeout(deadline)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout(deadline.as_secs())
            } else {
                RpcError::Transport(e.to_string())
            }
        })?;

    let status = response.status();
    if status.is_success() {
        return response
            .json::<Resp>()
            .await
            .map_err(|e| RpcError::Decode(e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<Ack>(&body) {
        Ok(Ack {
            ok: false,
            reason: Some(reason),
        }) => Err(RpcError::Rejected(reason)),
        _ => Err(RpcError::Status {
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        }),
    }
}

fn ensure_ok(ack: Ack) -> Result<(), RpcError> {
    if ack.ok {
        Ok(())
    } else {
        Err(RpcError::Rejected(
            ack.reason.unwrap_or_else(|| "rejected".to_string()),
        ))
    }
}

/// Coordinator-side client for calling workers.
pub struct HttpWorkerClient {
    client: Client,
    handoff_deadline: Duration,
    job_deadline: Duration,
}

impl HttpWorkerClient {
    /// `handoff_deadline` bounds assignment/cancel calls, `job_deadline`
    /// bounds ad-hoc jobs that return a result synchronously.
    pub fn new(handoff_deadline: Duration, job_deadline: Duration) -> Result<Self, RpcError> {
        Ok(Self {
            client: build_client()?,
            handoff_deadline,
            job_deadline,
        })
    }

    fn url(address: &str, path: &str) -> String {
        format!("{}/rpc/worker/{}", address.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn assign_stream(
        &self,
        address: &str,
        req: &AssignStreamRequest,
    ) -> Result<(), RpcError> {
        let url = Self::url(address, "assign-stream");
        ensure_ok(post_json(&self.client, &url, req, self.handoff_deadline).await?)
    }

    async fn cancel_stream(
        &self,
        address: &str,
        req: &CancelStreamRequest,
    ) -> Result<CancelStreamResponse, RpcError> {
        let url = Self::url(address, "cancel-stream");
        post_json(&self.client, &url, req, self.handoff_deadline).await
    }

    async fn assign_premiere(
        &self,
        address: &str,
        req: &AssignPremiereRequest,
    ) -> Result<(), RpcError> {
        let url = Self::url(address, "assign-premiere");
        ensure_ok(post_json(&self.client, &url, req, self.handoff_deadline).await?)
    }

    async fn generate_thumbnails(
        &self,
        address: &str,
        req: &GenerateThumbnailsRequest,
    ) -> Result<ThumbnailsResponse, RpcError> {
        let url = Self::url(address, "thumbnails");
        post_json(&self.client, &url, req, self.job_deadline).await
    }

    async fn live_preview(
        &self,
        address: &str,
        req: &LivePreviewRequest,
    ) -> Result<LivePreviewResponse, RpcError> {
        let url = Self::url(address, "live-preview");
        post_json(&self.client, &url, req, self.job_deadline).await
    }

    async fn section_images(
        &self,
        address: &str,
        req: &SectionImagesRequest,
    ) -> Result<SectionImagesResponse, RpcError> {
        let url = Self::url(address, "section-images");
        post_json(&self.client, &url, req, self.job_deadline).await
    }

    async fn delete_section_image(
        &self,
        address: &str,
        req: &DeleteSectionImageRequest,
    ) -> Result<(), RpcError> {
        let url = Self::url(address, "section-images/delete");
        ensure_ok(post_json(&self.client, &url, req, self.handoff_deadline).await?)
    }

    async fn waveform(
        &self,
        address: &str,
        req: &WaveformRequest,
    ) -> Result<WaveformResponse, RpcError> {
        let url = Self::url(address, "waveform");
        post_json(&self.client, &url, req, self.job_deadline).await
    }
}

/// Worker-side client for calling the coordinator.
pub struct HttpCoordinatorClient {
    client: Client,
    base_url: String,
    deadline: Duration,
}

impl HttpCoordinatorClient {
    pub fn new(base_url: impl Into<String>, deadline: Duration) -> Result<Self, RpcError> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.into(),
            deadline,
        })
    }

    async fn call<Req: Serialize + Sync>(&self, path: &str, req: &Req) -> Result<(), RpcError> {
        let url = format!(
            "{}/rpc/coordinator/{}",
            self.base_url.trim_end_matches('/'),
            path
        );
        ensure_ok(post_json(&self.client, &url, req, self.deadline).await?)
    }
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn register(&self, req: &RegisterRequest) -> Result<(), RpcError> {
        self.call("register", req).await
    }

    async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<(), RpcError> {
        self.call("heartbeat", req).await
    }

    async fn stream_started(&self, req: &StreamStartedRequest) -> Result<(), RpcError> {
        self.call("stream-started", req).await
    }

    async fn stream_finished(&self, req: &StreamFinishedRequest) -> Result<(), RpcError> {
        self.call("stream-finished", req).await
    }

    async fn transcoding_finished(
        &self,
        req: &TranscodingFinishedRequest,
    ) -> Result<(), RpcError> {
        self.call("transcoding-finished", req).await
    }

    async fn publish_finished(&self, req: &PublishFinishedRequest) -> Result<(), RpcError> {
        self.call("publish-finished", req).await
    }

    async fn silence_results(&self, req: &SilenceResultsRequest) -> Result<(), RpcError> {
        self.call("silence-results", req).await
    }

    async fn stage_failed(&self, req: &StageFailedRequest) -> Result<(), RpcError> {
        self.call("stage-failed", req).await
    }
}

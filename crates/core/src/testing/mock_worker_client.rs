//! Mock worker client for testing the coordinator.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::rpc::*;

/// Mock implementation of the WorkerClient trait.
///
/// Records every call that succeeded, and fails all calls to an address
/// configured with [`MockWorkerClient::fail_address`].
///
/// # Example
///
/// ```rust,ignore
/// use castfleet_core::testing::MockWorkerClient;
///
/// let client = MockWorkerClient::new();
/// client.fail_address("http://w2:8081", RpcError::Timeout(5)).await;
///
/// scheduler.run_pass(Utc::now()).await?;
/// assert_eq!(client.assignments().await.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MockWorkerClient {
    assignments: Arc<RwLock<Vec<AssignStreamRequest>>>,
    premieres: Arc<RwLock<Vec<AssignPremiereRequest>>>,
    cancellations: Arc<RwLock<Vec<CancelStreamRequest>>>,
    /// Ad-hoc job calls as (kind, worker_id).
    jobs: Arc<RwLock<Vec<(String, String)>>>,
    failures: Arc<RwLock<HashMap<String, RpcError>>>,
}

impl MockWorkerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call to `address` with `error`.
    pub async fn fail_address(&self, address: &str, error: RpcError) {
        self.failures
            .write()
            .await
            .insert(address.to_string(), error);
    }

    pub async fn clear_failures(&self) {
        self.failures.write().await.clear();
    }

    /// Accepted stream assignments, in call order.
    pub async fn assignments(&self) -> Vec<AssignStreamRequest> {
        self.assignments.read().await.clone()
    }

    pub async fn premieres(&self) -> Vec<AssignPremiereRequest> {
        self.premieres.read().await.clone()
    }

    pub async fn cancellations(&self) -> Vec<CancelStreamRequest> {
        self.cancellations.read().await.clone()
    }

    pub async fn jobs(&self) -> Vec<(String, String)> {
        self.jobs.read().await.clone()
    }

    async fn check(&self, address: &str) -> Result<(), RpcError> {
        match self.failures.read().await.get(address) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn record_job(&self, kind: &str, worker_id: &str) {
        self.jobs
            .write()
            .await
            .push((kind.to_string(), worker_id.to_string()));
    }
}

#[async_trait]
impl WorkerClient for MockWorkerClient {
    async fn assign_stream(
        &self,
        address: &str,
        req: &AssignStreamRequest,
    ) -> Result<(), RpcError> {
        self.check(address).await?;
        self.assignments.write().await.push(req.clone());
        Ok(())
    }

    async fn cancel_stream(
        &self,
        address: &str,
        req: &CancelStreamRequest,
    ) -> Result<CancelStreamResponse, RpcError> {
        self.check(address).await?;
        let mut cancellations = self.cancellations.write().await;
        // A repeated cancel for the same slot finds nothing left to stop
        let repeated = cancellations
            .iter()
            .any(|c| c.stream_id == req.stream_id && c.slot_name == req.slot_name);
        cancellations.push(req.clone());
        Ok(CancelStreamResponse {
            ok: true,
            cancelled: if repeated { 0 } else { 1 },
        })
    }

    async fn assign_premiere(
        &self,
        address: &str,
        req: &AssignPremiereRequest,
    ) -> Result<(), RpcError> {
        self.check(address).await?;
        self.premieres.write().await.push(req.clone());
        Ok(())
    }

    async fn generate_thumbnails(
        &self,
        address: &str,
        req: &GenerateThumbnailsRequest,
    ) -> Result<ThumbnailsResponse, RpcError> {
        self.check(address).await?;
        self.record_job("thumbnails", &req.worker_id).await;
        Ok(ThumbnailsResponse {
            ok: true,
            sprite_path: format!("/vod/thumbnails/{}/sprite.jpg", req.stream_id),
            thumbnail_path: format!("/vod/thumbnails/{}/poster.jpg", req.stream_id),
        })
    }

    async fn live_preview(
        &self,
        address: &str,
        req: &LivePreviewRequest,
    ) -> Result<LivePreviewResponse, RpcError> {
        self.check(address).await?;
        self.record_job("live_preview", &req.worker_id).await;
        Ok(LivePreviewResponse {
            ok: true,
            image: "/9j/".to_string(),
        })
    }

    async fn section_images(
        &self,
        address: &str,
        req: &SectionImagesRequest,
    ) -> Result<SectionImagesResponse, RpcError> {
        self.check(address).await?;
        self.record_job("section_images", &req.worker_id).await;
        Ok(SectionImagesResponse {
            ok: true,
            paths: req
                .timestamps
                .iter()
                .map(|t| format!("/vod/sections/{}/{}.jpg", req.stream_id, t))
                .collect(),
        })
    }

    async fn delete_section_image(
        &self,
        address: &str,
        req: &DeleteSectionImageRequest,
    ) -> Result<(), RpcError> {
        self.check(address).await?;
        self.record_job("delete_section_image", &req.worker_id).await;
        Ok(())
    }

    async fn waveform(
        &self,
        address: &str,
        req: &WaveformRequest,
    ) -> Result<WaveformResponse, RpcError> {
        self.check(address).await?;
        self.record_job("waveform", &req.worker_id).await;
        Ok(WaveformResponse {
            ok: true,
            waveform: "iVBORw0KGgo=".to_string(),
        })
    }
}

use async_trait::async_trait;

use super::error::RpcError;
use super::types::*;

/// Calls the coordinator makes on a worker.
///
/// `address` is the worker's base URL as recorded in the registry.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn assign_stream(&self, address: &str, req: &AssignStreamRequest)
        -> Result<(), RpcError>;

    async fn cancel_stream(
        &self,
        address: &str,
        req: &CancelStreamRequest,
    ) -> Result<CancelStreamResponse, RpcError>;

    async fn assign_premiere(
        &self,
        address: &str,
        req: &AssignPremiereRequest,
    ) -> Result<(), RpcError>;

    async fn generate_thumbnails(
        &self,
        address: &str,
        req: &GenerateThumbnailsRequest,
    ) -> Result<ThumbnailsResponse, RpcError>;

    async fn live_preview(
        &self,
        address: &str,
        req: &LivePreviewRequest,
    ) -> Result<LivePreviewResponse, RpcError>;

    async fn section_images(
        &self,
        address: &str,
        req: &SectionImagesRequest,
    ) -> Result<SectionImagesResponse, RpcError>;

    async fn delete_section_image(
        &self,
        address: &str,
        req: &DeleteSectionImageRequest,
    ) -> Result<(), RpcError>;

    async fn waveform(
        &self,
        address: &str,
        req: &WaveformRequest,
    ) -> Result<WaveformResponse, RpcError>;
}

/// Calls a worker makes on the coordinator.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn register(&self, req: &RegisterRequest) -> Result<(), RpcError>;

    async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<(), RpcError>;

    async fn stream_started(&self, req: &StreamStartedRequest) -> Result<(), RpcError>;

    async fn stream_finished(&self, req: &StreamFinishedRequest) -> Result<(), RpcError>;

    async fn transcoding_finished(&self, req: &TranscodingFinishedRequest)
        -> Result<(), RpcError>;

    async fn publish_finished(&self, req: &PublishFinishedRequest) -> Result<(), RpcError>;

    async fn silence_results(&self, req: &SilenceResultsRequest) -> Result<(), RpcError>;

    async fn stage_failed(&self, req: &StageFailedRequest) -> Result<(), RpcError>;
}

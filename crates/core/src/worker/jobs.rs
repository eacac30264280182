//! Ad-hoc jobs: single encoder calls answered in the same request.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{info, warn};

use super::pipeline::PipelineEngine;
use super::types::{PipelineError, Stage};
use crate::rpc::{
    DeleteSectionImageRequest, GenerateThumbnailsRequest, LivePreviewRequest,
    LivePreviewResponse, SectionImagesRequest, SectionImagesResponse, ThumbnailsResponse,
    WaveformRequest, WaveformResponse,
};

impl PipelineEngine {
    fn accept_job(&self, worker_id: &str) -> Result<(), PipelineError> {
        self.check_identity(worker_id)?;
        if self.is_draining() {
            return Err(PipelineError::Draining);
        }
        Ok(())
    }

    /// Sprite sheet and poster frame for a finished recording.
    pub async fn generate_thumbnails(
        &self,
        req: &GenerateThumbnailsRequest,
    ) -> Result<ThumbnailsResponse, PipelineError> {
        self.accept_job(&req.worker_id)?;
        let input = existing_file(&req.file_path).await?;

        let dir = self
            .config
            .output_dir
            .join("thumbnails")
            .join(req.stream_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let sprite = dir.join("sprite.jpg");
        let poster = dir.join("poster.jpg");

        self.tracked(
            Stage::Thumbnails,
            format!("thumbnails stream {}", req.stream_id),
            self.encoder.thumbnails(&input, &sprite, &poster),
        )
        .await
        .map_err(|e| PipelineError::encoder(Stage::Thumbnails, e))?;

        info!(stream_id = req.stream_id, sprite = %sprite.display(), "Generated thumbnails");
        Ok(ThumbnailsResponse {
            ok: true,
            sprite_path: sprite.to_string_lossy().to_string(),
            thumbnail_path: poster.to_string_lossy().to_string(),
        })
    }

    /// One JPEG frame from a live source.
    pub async fn live_preview(
        &self,
        req: &LivePreviewRequest,
    ) -> Result<LivePreviewResponse, PipelineError> {
        self.accept_job(&req.worker_id)?;
        if req.source_url.trim().is_empty() {
            return Err(PipelineError::Malformed("source_url is empty".to_string()));
        }

        let image = self
            .tracked(
                Stage::LivePreview,
                format!("live preview {}", req.source_url),
                self.encoder.live_preview(&req.source_url),
            )
            .await
            .map_err(|e| PipelineError::encoder(Stage::LivePreview, e))?;

        Ok(LivePreviewResponse {
            ok: true,
            image: STANDARD.encode(image),
        })
    }

    /// Frames at the given offsets, one file per offset.
    pub async fn section_images(
        &self,
        req: &SectionImagesRequest,
    ) -> Result<SectionImagesResponse, PipelineError> {
        self.accept_job(&req.worker_id)?;
        if req.timestamps.is_empty() {
            return Err(PipelineError::Malformed("no timestamps given".to_string()));
        }
        let input = existing_file(&req.file_path).await?;

        let dir = self
            .config
            .output_dir
            .join("sections")
            .join(req.stream_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let paths = self
            .tracked(
                Stage::SectionImages,
                format!("section images stream {}", req.stream_id),
                async {
                    let mut paths = Vec::with_capacity(req.timestamps.len());
                    for at in &req.timestamps {
                        let output = dir.join(format!("{}.jpg", at));
                        self.encoder.section_image(&input, *at, &output).await?;
                        paths.push(output.to_string_lossy().to_string());
                    }
                    Ok(paths)
                },
            )
            .await
            .map_err(|e| PipelineError::encoder(Stage::SectionImages, e))?;

        Ok(SectionImagesResponse { ok: true, paths })
    }

    /// Queue a section image for deletion.
    ///
    /// Only files under the output directory are accepted.
    pub async fn delete_section_image(
        &self,
        req: &DeleteSectionImageRequest,
    ) -> Result<(), PipelineError> {
        self.check_identity(&req.worker_id)?;

        let path = existing_file(&req.path).await?;
        let path = tokio::fs::canonicalize(&path).await?;
        let root = tokio::fs::canonicalize(&self.config.output_dir).await?;
        if !path.starts_with(&root) {
            warn!(path = %path.display(), "Refusing to delete file outside the output directory");
            return Err(PipelineError::Malformed(format!(
                "{} is outside the output directory",
                req.path
            )));
        }

        self.deletion.add(path).await?;
        Ok(())
    }

    /// Audio waveform of a recording as PNG.
    pub async fn waveform(&self, req: &WaveformRequest) -> Result<WaveformResponse, PipelineError> {
        self.accept_job(&req.worker_id)?;
        let input = existing_file(&req.file_path).await?;

        let png = self
            .tracked(
                Stage::Waveform,
                format!("waveform {}", input.display()),
                self.encoder.waveform(&input),
            )
            .await
            .map_err(|e| PipelineError::encoder(Stage::Waveform, e))?;

        Ok(WaveformResponse {
            ok: true,
            waveform: STANDARD.encode(png),
        })
    }
}

async fn existing_file(path: &str) -> Result<PathBuf, PipelineError> {
    if path.trim().is_empty() {
        return Err(PipelineError::Malformed("file path is empty".to_string()));
    }
    let path = Path::new(path);
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(PipelineError::Malformed(format!(
            "file not found: {}",
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deletion::DeletionQueue;
    use crate::status::{StatusReporter, WorkerIdentity};
    use crate::testing::{fixtures, MockCoordinatorClient, MockEncoder};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn engine(dir: &TempDir) -> (Arc<PipelineEngine>, Arc<MockEncoder>, Arc<DeletionQueue>) {
        let config = fixtures::worker_config("w1", dir.path());
        tokio::fs::create_dir_all(&config.output_dir).await.unwrap();
        let encoder = Arc::new(MockEncoder::new());
        let coordinator = Arc::new(MockCoordinatorClient::new());
        let status = Arc::new(StatusReporter::new(
            WorkerIdentity {
                id: "w1".to_string(),
                address: "http://w1".to_string(),
                version: "test".to_string(),
                tenant: None,
                shared: true,
            },
            coordinator.clone(),
        ));
        let deletion = Arc::new(
            DeletionQueue::load(&config.deletion_queue_file, chrono::Duration::hours(24))
                .await
                .unwrap(),
        );
        let engine = Arc::new(PipelineEngine::new(
            config,
            encoder.clone(),
            None,
            coordinator,
            status,
            deletion.clone(),
        ));
        (engine, encoder, deletion)
    }

    async fn vod(engine: &PipelineEngine) -> String {
        let path = engine.config().output_dir.join("lecture.mp4");
        tokio::fs::write(&path, b"vod").await.unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_live_preview_is_base64() {
        let dir = TempDir::new().unwrap();
        let (engine, encoder, _) = engine(&dir).await;
        encoder.set_preview_bytes(vec![0xff, 0xd8, 0xff]).await;

        let response = engine
            .live_preview(&LivePreviewRequest {
                worker_id: "w1".to_string(),
                source_url: "rtsp://cam/1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(STANDARD.decode(response.image).unwrap(), vec![0xff, 0xd8, 0xff]);
        assert_eq!(engine.status().workload, 0);
    }

    #[tokio::test]
    async fn test_job_identity_mismatch() {
        let dir = TempDir::new().unwrap();
        let (engine, _, _) = engine(&dir).await;
        let err = engine
            .live_preview(&LivePreviewRequest {
                worker_id: "someone-else".to_string(),
                source_url: "rtsp://cam/1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::IdentityMismatch));
    }

    #[tokio::test]
    async fn test_section_images_one_per_timestamp() {
        let dir = TempDir::new().unwrap();
        let (engine, _, _) = engine(&dir).await;
        let file_path = vod(&engine).await;

        let response = engine
            .section_images(&SectionImagesRequest {
                worker_id: "w1".to_string(),
                stream_id: 4,
                file_path,
                timestamps: vec![0, 600, 1200],
            })
            .await
            .unwrap();
        assert_eq!(response.paths.len(), 3);
        assert!(response.paths[1].ends_with("sections/4/600.jpg"));
    }

    #[tokio::test]
    async fn test_thumbnails_missing_input() {
        let dir = TempDir::new().unwrap();
        let (engine, _, _) = engine(&dir).await;
        let err = engine
            .generate_thumbnails(&GenerateThumbnailsRequest {
                worker_id: "w1".to_string(),
                stream_id: 1,
                file_path: "/nonexistent.mp4".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_thumbnails_paths() {
        let dir = TempDir::new().unwrap();
        let (engine, _, _) = engine(&dir).await;
        let file_path = vod(&engine).await;
        let response = engine
            .generate_thumbnails(&GenerateThumbnailsRequest {
                worker_id: "w1".to_string(),
                stream_id: 2,
                file_path,
            })
            .await
            .unwrap();
        assert!(response.sprite_path.ends_with("thumbnails/2/sprite.jpg"));
        assert!(response.thumbnail_path.ends_with("thumbnails/2/poster.jpg"));
    }

    #[tokio::test]
    async fn test_delete_section_image_queues_file() {
        let dir = TempDir::new().unwrap();
        let (engine, _, deletion) = engine(&dir).await;
        let path = vod(&engine).await;

        engine
            .delete_section_image(&DeleteSectionImageRequest {
                worker_id: "w1".to_string(),
                path,
            })
            .await
            .unwrap();
        assert_eq!(deletion.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_outside_output_dir_refused() {
        let dir = TempDir::new().unwrap();
        let (engine, _, deletion) = engine(&dir).await;
        let outside = dir.path().join("elsewhere.jpg");
        tokio::fs::write(&outside, b"img").await.unwrap();

        let err = engine
            .delete_section_image(&DeleteSectionImageRequest {
                worker_id: "w1".to_string(),
                path: outside.to_string_lossy().to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Malformed(_)));
        assert!(deletion.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_waveform_encoder_failure() {
        let dir = TempDir::new().unwrap();
        let (engine, encoder, _) = engine(&dir).await;
        let file_path = vod(&engine).await;
        encoder.fail_jobs(true).await;

        let err = engine
            .waveform(&WaveformRequest {
                worker_id: "w1".to_string(),
                file_path,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Encoder {
                stage: Stage::Waveform,
                ..
            }
        ));
        assert_eq!(engine.status().workload, 0);
    }
}

//! VOD publishing.

use async_trait::async_trait;
use reqwest::{multipart, Client};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::streams::SourceVariant;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("publisher returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid publisher response: {0}")]
    Decode(String),
}

/// A transcoded recording to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub stream_id: i64,
    pub course_slug: String,
    pub variant: SourceVariant,
    pub file_path: PathBuf,
}

/// Where the published VOD can be played.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PublishedVod {
    pub vod_url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

/// Makes a transcoded file available for playback.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, req: &PublishRequest) -> Result<PublishedVod, PublishError>;
}

/// Uploads VOD files to an HTTP endpoint as multipart form data.
///
/// The endpoint answers with `{"vod_url": "...", "thumbnail_url": "..."}`.
pub struct HttpPublisher {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpPublisher {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self, PublishError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(6 * 3600))
            .tcp_keepalive(Duration::from_secs(600))
            .build()
            .map_err(|e| PublishError::Upload(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, req: &PublishRequest) -> Result<PublishedVod, PublishError> {
        let file = tokio::fs::File::open(&req.file_path)
            .await
            .map_err(|e| PublishError::Io {
                path: req.file_path.clone(),
                source: e,
            })?;
        let len = file
            .metadata()
            .await
            .map_err(|e| PublishError::Io {
                path: req.file_path.clone(),
                source: e,
            })?
            .len();
        let file_name = req
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "recording.mp4".to_string());

        let part = multipart::Part::stream_with_length(reqwest::Body::from(file), len)
            .file_name(file_name)
            .mime_str("video/mp4")
            .map_err(|e| PublishError::Upload(e.to_string()))?;
        let form = multipart::Form::new()
            .text("stream_id", req.stream_id.to_string())
            .text("course", req.course_slug.clone())
            .text("variant", req.variant.as_str())
            .part("file", part);

        info!(
            stream_id = req.stream_id,
            variant = %req.variant,
            bytes = len,
            "Uploading VOD"
        );

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PublishError::Upload(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        response
            .json::<PublishedVod>()
            .await
            .map_err(|e| PublishError::Decode(e.to_string()))
    }
}

//! Mock VOD publisher.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::worker::{PublishError, PublishRequest, PublishedVod, Publisher};

/// Mock implementation of the Publisher trait.
///
/// Records published files and answers with a deterministic VOD URL.
#[derive(Debug, Default)]
pub struct MockPublisher {
    published: Arc<RwLock<Vec<PublishRequest>>>,
    fail: Arc<RwLock<bool>>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail(&self, fail: bool) {
        *self.fail.write().await = fail;
    }

    pub async fn published(&self) -> Vec<PublishRequest> {
        self.published.read().await.clone()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, req: &PublishRequest) -> Result<PublishedVod, PublishError> {
        if *self.fail.read().await {
            return Err(PublishError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        self.published.write().await.push(req.clone());
        Ok(PublishedVod {
            vod_url: format!(
                "https://vod.example/{}/{}/{}.m3u8",
                req.course_slug, req.stream_id, req.variant
            ),
            thumbnail_url: None,
        })
    }
}

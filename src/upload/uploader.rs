use anyhow::Result;
use async_trait::async_trait;

use crate::api::ApiClient;

use super::UploadItem;

/// Transport seam for the queue manager. The HTTP implementation talks
/// to the sync server; tests substitute recording fakes.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, item: &UploadItem) -> Result<()>;
}

/// Uploads through the authenticated sync API.
pub struct HttpUploader {
    api: ApiClient,
}

impl HttpUploader {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, item: &UploadItem) -> Result<()> {
        self.api.upload_file(&item.path, &item.relative_path).await
    }
}

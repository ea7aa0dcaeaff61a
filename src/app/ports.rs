use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

// Fetch-side ports
#[async_trait]
pub trait HttpClientPort: Send + Sync {
    /// GET `url` and stream a successful body into `dest`, creating or
    /// truncating it. Non-success statuses are returned as data with nothing
    /// written. Transport failures, including a body cut off midway, map to
    /// `IngestError::Network` and may leave a partial `dest` behind.
    async fn download(&self, url: &str, dest: &Path) -> Result<HttpDownload>;
}

#[derive(Clone, Debug)]
pub struct HttpDownload {
    pub status: u16,
    pub content_type: String,
    /// Advertised `Content-Length`, when the server sent one.
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Body bytes written to `dest`.
    pub bytes_written: u64,
    /// Hex SHA-256 of the body, computed while streaming.
    pub sha256: String,
}

impl HttpDownload {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }
}

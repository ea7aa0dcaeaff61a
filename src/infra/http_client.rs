use crate::app::ports::{HttpClientPort, HttpDownload};
use crate::config::SourceConfig;
use crate::error::{IngestError, Result};
use crate::idempotency::ContentHasher;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};

pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new(source: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(source.connect_timeout_seconds))
            .timeout(Duration::from_secs(source.timeout_seconds))
            .user_agent(concat!("nyc_taxi_ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

fn header(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn network(url: &str, e: reqwest::Error) -> IngestError {
    IngestError::Network {
        url: url.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl HttpClientPort for ReqwestHttp {
    async fn download(&self, url: &str, dest: &Path) -> Result<HttpDownload> {
        let mut resp = self.client.get(url).send().await.map_err(|e| network(url, e))?;
        let headers = resp.headers();
        let mut download = HttpDownload {
            status: resp.status().as_u16(),
            content_type: header(headers, CONTENT_TYPE)
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            content_length: header(headers, CONTENT_LENGTH).and_then(|s| s.parse().ok()),
            etag: header(headers, ETAG),
            last_modified: header(headers, LAST_MODIFIED),
            bytes_written: 0,
            sha256: String::new(),
        };
        if !download.is_success() {
            return Ok(download);
        }

        // Body goes straight to disk; only one chunk is held in memory
        let mut out = BufWriter::new(tokio::fs::File::create(dest).await?);
        let mut hasher = ContentHasher::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| network(url, e))? {
            hasher.update(&chunk);
            out.write_all(&chunk).await?;
            download.bytes_written += chunk.len() as u64;
        }
        out.flush().await?;
        out.into_inner().sync_all().await?;

        download.sha256 = hasher.finish();
        Ok(download)
    }
}

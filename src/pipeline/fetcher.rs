use crate::app::ports::{HttpClientPort, HttpDownload};
use crate::config::SourceConfig;
use crate::constants::PARQUET_MAGIC;
use crate::error::{IngestError, Result};
use crate::infra::http_client::ReqwestHttp;
use crate::observability::metrics;
use crate::pipeline::local_file::{ContentMarker, LocalCopy, LocalFile};
use crate::pipeline::rate_limiter::{Limits, RateLimiter};
use crate::types::DatasetIdentifier;
use chrono::Utc;
use rand::Rng;
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, instrument, warn};

/// Result of fetching one identifier.
#[derive(Debug)]
pub enum FetchOutcome {
    Downloaded(LocalFile),
    /// A valid local copy already existed; no request was made.
    Skipped(LocalFile),
}

#[derive(Debug)]
pub struct FetchFailure {
    pub identifier: DatasetIdentifier,
    pub error: IngestError,
}

/// Aggregate of a fetch run, each list sorted by identifier.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub downloaded: Vec<LocalFile>,
    pub skipped: Vec<LocalFile>,
    pub failed: Vec<FetchFailure>,
}

impl FetchReport {
    /// Every usable local file, downloaded or pre-existing, oldest first.
    pub fn files(&self) -> Vec<LocalFile> {
        let mut files: Vec<LocalFile> = self
            .downloaded
            .iter()
            .chain(self.skipped.iter())
            .cloned()
            .collect();
        files.sort_by_key(|f| f.identifier);
        files
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Downloads monthly source files into a local directory.
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<SourceConfig>,
    http: Arc<dyn HttpClientPort>,
    limiter: RateLimiter,
}

impl Fetcher {
    pub fn new(source: SourceConfig, http: Arc<dyn HttpClientPort>) -> Self {
        let limiter = RateLimiter::new(Limits {
            requests_per_min: source.requests_per_min,
            concurrency: Some(source.concurrency.max(1)),
        });
        Self { source: Arc::new(source), http, limiter }
    }

    pub fn with_reqwest(source: SourceConfig) -> Result<Self> {
        let http = ReqwestHttp::new(&source)?;
        Ok(Self::new(source, Arc::new(http)))
    }

    /// Fetch every identifier into `destination`.
    ///
    /// Identifiers are independent: a failure is recorded in the report and
    /// never stops the others. Only an unusable destination fails the call.
    #[instrument(skip_all, fields(count = identifiers.len(), destination = %destination.display()))]
    pub async fn fetch(
        &self,
        identifiers: &[DatasetIdentifier],
        destination: &Path,
    ) -> Result<FetchReport> {
        tokio::fs::create_dir_all(destination).await?;

        let unique: BTreeSet<DatasetIdentifier> = identifiers.iter().copied().collect();
        let mut handles = Vec::with_capacity(unique.len());
        for id in unique {
            let fetcher = self.clone();
            let dest = destination.to_path_buf();
            let handle = tokio::spawn(async move { fetcher.fetch_one(id, dest).await });
            handles.push((id, handle));
        }

        let mut report = FetchReport::default();
        for (id, handle) in handles {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => Err(IngestError::Task(e.to_string())),
            };
            match result {
                Ok(FetchOutcome::Downloaded(file)) => report.downloaded.push(file),
                Ok(FetchOutcome::Skipped(file)) => report.skipped.push(file),
                Err(error) => {
                    warn!(identifier = %id, error = %error, "fetch failed");
                    metrics::fetch::failed(error.kind());
                    report.failed.push(FetchFailure { identifier: id, error });
                }
            }
        }

        info!(
            downloaded = report.downloaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "fetch finished"
        );
        Ok(report)
    }

    #[instrument(skip(self, dest), fields(identifier = %id))]
    async fn fetch_one(&self, id: DatasetIdentifier, dest: PathBuf) -> Result<FetchOutcome> {
        let dataset = self.source.dataset.clone();

        // Hashing a large file is blocking work
        let inspect_dir = dest.clone();
        let inspect_dataset = dataset.clone();
        let copy = tokio::task::spawn_blocking(move || {
            LocalFile::inspect(&inspect_dir, &inspect_dataset, &id)
        })
        .await
        .map_err(|e| IngestError::Task(e.to_string()))??;

        match copy {
            LocalCopy::Valid(file) => {
                info!(path = %file.path.display(), "valid local copy present, skipping download");
                metrics::fetch::skipped();
                return Ok(FetchOutcome::Skipped(file));
            }
            LocalCopy::Invalid { path, reason } => {
                warn!(path = %path.display(), %reason, "discarding invalid local copy");
                LocalFile::remove_artifacts(&path)?;
            }
            LocalCopy::Missing => {}
        }

        let file_name = id.file_name(&dataset);
        let url = self.source.url_for(&file_name);
        let path = LocalFile::expected_path(&dest, &dataset, &id);
        let started = Instant::now();
        let file = match self.download_and_place(id, &url, &path).await {
            Ok(file) => file,
            Err(e) => {
                LocalFile::remove_artifacts(&path)?;
                return Err(e);
            }
        };

        metrics::fetch::downloaded(file.size_bytes, started.elapsed().as_secs_f64());
        info!(path = %file.path.display(), bytes = file.size_bytes, "downloaded");
        Ok(FetchOutcome::Downloaded(file))
    }

    /// Stream into the `.part` file, validate it on disk, then rename it into
    /// place and write the sidecar. The caller removes every artifact on error.
    async fn download_and_place(
        &self,
        id: DatasetIdentifier,
        url: &str,
        path: &Path,
    ) -> Result<LocalFile> {
        let partial = LocalFile::partial_path(path);
        let download = self.download_with_retries(url, &partial).await?;
        debug!(content_type = %download.content_type, bytes = download.bytes_written, "validating download");

        let file_name = id.file_name(&self.source.dataset);
        validate_download(&file_name, &download, &partial).await?;
        tokio::fs::rename(&partial, path).await?;

        let marker = ContentMarker {
            url: url.to_string(),
            sha256: download.sha256,
            size_bytes: download.bytes_written,
            etag: download.etag,
            last_modified: download.last_modified,
            fetched_at: Utc::now(),
        };
        LocalFile::write_marker(path, &marker)?;

        Ok(LocalFile {
            identifier: id,
            dataset: self.source.dataset.clone(),
            path: path.to_path_buf(),
            size_bytes: marker.size_bytes,
            marker: Some(marker),
        })
    }

    async fn download_with_retries(&self, url: &str, partial: &Path) -> Result<HttpDownload> {
        let mut attempt: u32 = 0;
        loop {
            let permit = self.limiter.acquire().await;
            let result = self.http.download(url, partial).await;
            drop(permit);

            let err = match result {
                Ok(download) if download.is_success() => return Ok(download),
                Ok(download) => IngestError::HttpStatus { url: url.to_string(), status: download.status },
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= self.source.retries {
                return Err(err);
            }

            attempt += 1;
            metrics::fetch::retried();
            let base = self.source.retry_backoff_ms.saturating_mul(1u64 << (attempt - 1).min(10));
            let jitter = rand::thread_rng().gen_range(0..=self.source.retry_backoff_ms / 2);
            let wait = Duration::from_millis(base + jitter);
            warn!(%url, attempt, error = %err, wait_ms = wait.as_millis() as u64, "retrying fetch");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Reject empty, truncated and non-Parquet downloads by checking the bytes
/// that actually reached `partial`.
pub async fn validate_download(file_name: &str, download: &HttpDownload, partial: &Path) -> Result<()> {
    let fail = |reason: String| IngestError::Validation { file: file_name.to_string(), reason };
    let on_disk = tokio::fs::metadata(partial).await?.len();
    if on_disk != download.bytes_written {
        return Err(fail(format!("wrote {} of {} received bytes", on_disk, download.bytes_written)));
    }
    if on_disk == 0 {
        return Err(fail("empty response body".into()));
    }
    if let Some(expected) = download.content_length {
        if expected != on_disk {
            return Err(fail(format!("received {} of {} advertised bytes", on_disk, expected)));
        }
    }

    let width = PARQUET_MAGIC.len() as u64;
    if on_disk < 2 * width {
        return Err(fail("payload is too short to be a Parquet file".into()));
    }
    let mut file = tokio::fs::File::open(partial).await?;
    let mut head = [0u8; 4];
    let mut tail = [0u8; 4];
    file.read_exact(&mut head).await?;
    file.seek(SeekFrom::End(-(width as i64))).await?;
    file.read_exact(&mut tail).await?;
    if head != *PARQUET_MAGIC || tail != *PARQUET_MAGIC {
        return Err(fail("payload is not a Parquet file (missing PAR1 magic)".into()));
    }
    Ok(())
}

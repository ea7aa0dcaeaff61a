//! On-disk contract between the fetcher and the loader.
//!
//! A fetched file lives at `{data_dir}/{dataset}_{YYYY-MM}.parquet` next to a
//! `.meta.json` sidecar holding its content marker. Downloads in flight use a
//! `.part` suffix and are never picked up by discovery.

use crate::constants::{PARTIAL_SUFFIX, SIDECAR_SUFFIX};
use crate::error::Result;
use crate::idempotency::{batch_key, file_sha256_hex};
use crate::types::DatasetIdentifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What the fetcher recorded about a download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMarker {
    pub url: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalFile {
    pub identifier: DatasetIdentifier,
    pub dataset: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub marker: Option<ContentMarker>,
}

/// State of the expected local copy for one identifier.
#[derive(Debug)]
pub enum LocalCopy {
    Missing,
    Valid(LocalFile),
    Invalid { path: PathBuf, reason: String },
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl LocalFile {
    pub fn batch_key(&self) -> String {
        batch_key(&self.dataset, &self.identifier)
    }

    pub fn file_name(&self) -> String {
        self.identifier.file_name(&self.dataset)
    }

    pub fn expected_path(dir: &Path, dataset: &str, identifier: &DatasetIdentifier) -> PathBuf {
        dir.join(identifier.file_name(dataset))
    }

    pub fn sidecar_path(path: &Path) -> PathBuf {
        with_suffix(path, SIDECAR_SUFFIX)
    }

    pub fn partial_path(path: &Path) -> PathBuf {
        with_suffix(path, PARTIAL_SUFFIX)
    }

    pub fn read_marker(path: &Path) -> Result<Option<ContentMarker>> {
        let sidecar = Self::sidecar_path(path);
        match fs::read_to_string(&sidecar) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_marker(path: &Path, marker: &ContentMarker) -> Result<()> {
        let json = serde_json::to_string_pretty(marker)?;
        fs::write(Self::sidecar_path(path), json)?;
        Ok(())
    }

    /// Check the expected copy for `identifier` without touching the network.
    ///
    /// A copy is valid when it is non-empty and, if a sidecar exists, its size
    /// and checksum match what the last fetch recorded.
    pub fn inspect(dir: &Path, dataset: &str, identifier: &DatasetIdentifier) -> Result<LocalCopy> {
        let path = Self::expected_path(dir, dataset, identifier);
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LocalCopy::Missing),
            Err(e) => return Err(e.into()),
        };
        let size_bytes = meta.len();
        if size_bytes == 0 {
            return Ok(LocalCopy::Invalid { path, reason: "file is empty".into() });
        }

        let marker = match Self::read_marker(&path) {
            Ok(m) => m,
            Err(e) => {
                return Ok(LocalCopy::Invalid {
                    path,
                    reason: format!("unreadable sidecar: {}", e),
                })
            }
        };
        if let Some(m) = &marker {
            if m.size_bytes != size_bytes {
                return Ok(LocalCopy::Invalid {
                    path,
                    reason: format!("size {} differs from recorded {}", size_bytes, m.size_bytes),
                });
            }
            let actual = file_sha256_hex(&path)?;
            if actual != m.sha256 {
                return Ok(LocalCopy::Invalid { path, reason: "checksum differs from sidecar".into() });
            }
        }

        Ok(LocalCopy::Valid(LocalFile {
            identifier: *identifier,
            dataset: dataset.to_string(),
            path,
            size_bytes,
            marker,
        }))
    }

    /// Remove a file together with its sidecar and any partial download.
    pub fn remove_artifacts(path: &Path) -> io::Result<()> {
        remove_if_exists(path)?;
        remove_if_exists(&Self::sidecar_path(path))?;
        remove_if_exists(&Self::partial_path(path))?;
        Ok(())
    }

    /// Valid files of `dataset` in `dir`, oldest identifier first.
    pub fn discover(dir: &Path, dataset: &str) -> Result<Vec<LocalFile>> {
        let mut identifiers = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match DatasetIdentifier::from_file_name(name, dataset) {
                Some(id) => identifiers.push(id),
                None => debug!(file = name, "ignoring non-dataset file"),
            }
        }
        identifiers.sort();

        let mut files = Vec::with_capacity(identifiers.len());
        for id in identifiers {
            match Self::inspect(dir, dataset, &id)? {
                LocalCopy::Valid(file) => files.push(file),
                LocalCopy::Invalid { path, reason } => {
                    warn!(path = %path.display(), %reason, "skipping invalid local file");
                }
                LocalCopy::Missing => {}
            }
        }
        Ok(files)
    }
}

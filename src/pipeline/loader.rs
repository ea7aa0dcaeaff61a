use crate::config::{LoadConfig, StorageConfig};
use crate::error::{IngestError, Result};
use crate::observability::metrics;
use crate::pipeline::local_file::LocalFile;
use crate::pipeline::reader::TripReader;
use crate::storage::{RecordSource, TripStore, WriteOutcome};
use crate::types::{DatasetIdentifier, LoadedBatch, RejectReason};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{info, info_span, instrument, warn};
use uuid::Uuid;

#[derive(Debug)]
pub enum BatchStatus {
    Loaded(LoadedBatch),
    /// A marker already existed; the file was not parsed.
    Skipped(LoadedBatch),
    Failed(IngestError),
}

/// Result of loading one local file.
#[derive(Debug)]
pub struct BatchOutcome {
    pub identifier: DatasetIdentifier,
    pub batch_key: String,
    pub status: BatchStatus,
    pub accepted: u64,
    pub rejected: u64,
    pub rejections: BTreeMap<RejectReason, u64>,
    /// Source layout the file was read with.
    pub revision: Option<&'static str>,
}

impl BatchOutcome {
    fn new(identifier: DatasetIdentifier, batch_key: String, status: BatchStatus) -> Self {
        Self {
            identifier,
            batch_key,
            status,
            accepted: 0,
            rejected: 0,
            rejections: BTreeMap::new(),
            revision: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub run_id: String,
    /// One entry per distinct input file, in input order.
    pub outcomes: Vec<BatchOutcome>,
}

impl LoadReport {
    pub fn loaded(&self) -> impl Iterator<Item = &LoadedBatch> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            BatchStatus::Loaded(b) => Some(b),
            _ => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = &BatchOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, BatchStatus::Skipped(_)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&BatchOutcome, &IngestError)> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            BatchStatus::Failed(e) => Some((o, e)),
            _ => None,
        })
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }
}

/// Loads fetched files into the trip store, one batch per file.
#[derive(Debug, Clone)]
pub struct Loader {
    database_path: PathBuf,
    busy_timeout: Duration,
    concurrency: usize,
    force_reload: bool,
    run_id: String,
}

impl Loader {
    pub fn new(storage: &StorageConfig, load: &LoadConfig) -> Self {
        Self {
            database_path: storage.database_path.clone(),
            busy_timeout: Duration::from_millis(storage.busy_timeout_ms),
            concurrency: load.concurrency.max(1) as usize,
            force_reload: load.force_reload,
            run_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_force_reload(mut self, force_reload: bool) -> Self {
        self.force_reload = force_reload;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Load every file. Files are independent: a failure is recorded in its
    /// outcome and the rest continue. Only an unusable store fails the call.
    #[instrument(skip_all, fields(count = files.len(), run_id = %self.run_id, force = self.force_reload))]
    pub async fn load(&self, files: &[LocalFile]) -> Result<LoadReport> {
        // Create the schema once before workers race for it
        let database_path = self.database_path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || TripStore::open(&database_path, busy_timeout).map(|_| ()))
            .await
            .map_err(|e| IngestError::Task(e.to_string()))??;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut seen = HashSet::new();
        let mut handles = Vec::with_capacity(files.len());
        for file in files {
            let batch_key = file.batch_key();
            if !seen.insert(batch_key.clone()) {
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| IngestError::Task(e.to_string()))?;
            let loader = self.clone();
            let file = file.clone();
            let identifier = file.identifier;
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                loader.load_file(&file)
            });
            handles.push((identifier, batch_key, handle));
        }

        let mut report = LoadReport { run_id: self.run_id.clone(), outcomes: Vec::with_capacity(handles.len()) };
        for (identifier, batch_key, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => BatchOutcome::new(
                    identifier,
                    batch_key,
                    BatchStatus::Failed(IngestError::Task(e.to_string())),
                ),
            };
            report.outcomes.push(outcome);
        }

        info!(
            loaded = report.loaded().count(),
            skipped = report.skipped().count(),
            failed = report.failed().count(),
            "load finished"
        );
        Ok(report)
    }

    /// Load one file on the current thread with its own store connection.
    pub fn load_file(&self, file: &LocalFile) -> BatchOutcome {
        let batch_key = file.batch_key();
        let span = info_span!("load_file", batch_key = %batch_key, path = %file.path.display());
        let _entered = span.enter();

        let started = Instant::now();
        match self.try_load(file, &batch_key, started) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(error = %error, kind = error.kind(), "load failed, batch left unchanged");
                metrics::load::batch_failed(error.kind());
                BatchOutcome::new(file.identifier, batch_key, BatchStatus::Failed(error))
            }
        }
    }

    fn try_load(&self, file: &LocalFile, batch_key: &str, started: Instant) -> Result<BatchOutcome> {
        let mut store = TripStore::open(&self.database_path, self.busy_timeout)?;

        if !self.force_reload {
            if let Some(existing) = store.batch(batch_key)? {
                info!(loaded_at = %existing.loaded_at, rows = existing.row_count, "already loaded, skipping");
                metrics::load::batch_skipped();
                return Ok(BatchOutcome::new(
                    file.identifier,
                    batch_key.to_string(),
                    BatchStatus::Skipped(existing),
                ));
            }
        }

        let mut reader = TripReader::open(&file.path)?;
        let written = store.replace_batch(
            batch_key,
            file.identifier,
            &self.run_id,
            self.force_reload,
            &mut reader,
        )?;

        let status = match written {
            WriteOutcome::Loaded(batch) => {
                metrics::load::batch_loaded(
                    batch.row_count,
                    batch.rejected_count,
                    batch.replaced_rows,
                    started.elapsed().as_secs_f64(),
                );
                if batch.rejected_count > 0 {
                    warn!(rejected = batch.rejected_count, reasons = ?reader.rejections(), "rows rejected");
                }
                info!(
                    rows = batch.row_count,
                    rejected = batch.rejected_count,
                    replaced = batch.replaced_rows,
                    revision = reader.revision(),
                    "batch loaded"
                );
                BatchStatus::Loaded(batch)
            }
            // Another worker committed the same batch between the pre-check and our lock
            WriteOutcome::AlreadyLoaded(batch) => {
                metrics::load::batch_skipped();
                info!("already loaded, skipping");
                BatchStatus::Skipped(batch)
            }
        };

        Ok(BatchOutcome {
            identifier: file.identifier,
            batch_key: batch_key.to_string(),
            status,
            accepted: reader.accepted(),
            rejected: reader.rejected(),
            rejections: reader.rejections().clone(),
            revision: Some(reader.revision()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn loader_for(dir: &std::path::Path) -> Loader {
        let storage = StorageConfig {
            database_path: dir.join("taxi.sqlite"),
            ..StorageConfig::default()
        };
        Loader::new(&storage, &LoadConfig::default())
    }

    #[test]
    fn test_run_ids_are_unique() {
        let dir = tempdir().unwrap();
        assert_ne!(loader_for(dir.path()).run_id(), loader_for(dir.path()).run_id());
    }

    #[tokio::test]
    async fn test_unreadable_file_fails_only_that_batch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("yellow_tripdata_2024-01.parquet");
        std::fs::write(&path, b"not parquet at all").unwrap();
        let file = LocalFile {
            identifier: "2024-01".parse().unwrap(),
            dataset: "yellow_tripdata".into(),
            path,
            size_bytes: 18,
            marker: None,
        };

        let report = loader_for(dir.path()).load(&[file.clone(), file]).await.unwrap();
        // Duplicate inputs collapse to one outcome
        assert_eq!(report.outcomes.len(), 1);
        assert!(report.has_failures());
        let (outcome, error) = report.failed().next().unwrap();
        assert_eq!(outcome.batch_key, "yellow_tripdata_2024-01");
        assert_eq!(error.kind(), "decode");
    }

    #[tokio::test]
    async fn test_empty_input_creates_store() {
        let dir = tempdir().unwrap();
        let report = loader_for(dir.path()).load(&[]).await.unwrap();
        assert!(report.outcomes.is_empty());
        assert!(dir.path().join("taxi.sqlite").exists());
    }
}

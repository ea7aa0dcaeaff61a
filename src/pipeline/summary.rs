use crate::pipeline::fetcher::FetchReport;
use crate::pipeline::loader::{BatchStatus, LoadReport};
use crate::types::DatasetIdentifier;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryLine {
    pub status: ItemStatus,
    pub detail: String,
}

/// Per-identifier `{succeeded, skipped, failed}` view of a command run.
#[derive(Debug, Default)]
pub struct RunSummary {
    lines: BTreeMap<DatasetIdentifier, SummaryLine>,
}

impl RunSummary {
    pub fn from_fetch(report: &FetchReport) -> Self {
        let mut summary = Self::default();
        summary.record_fetch(report);
        summary
    }

    pub fn from_load(report: &LoadReport) -> Self {
        let mut summary = Self::default();
        summary.record_load(report);
        summary
    }

    /// Fetch outcomes, with load outcomes taking precedence for identifiers
    /// that reached the loader.
    pub fn from_run(fetch: &FetchReport, load: &LoadReport) -> Self {
        let mut summary = Self::default();
        summary.record_fetch(fetch);
        summary.record_load(load);
        summary
    }

    fn record(&mut self, id: DatasetIdentifier, status: ItemStatus, detail: String) {
        self.lines.insert(id, SummaryLine { status, detail });
    }

    /// Mark an identifier failed before it reached either stage.
    pub fn record_failure(&mut self, id: DatasetIdentifier, detail: impl Into<String>) {
        self.record(id, ItemStatus::Failed, detail.into());
    }

    fn record_fetch(&mut self, report: &FetchReport) {
        for file in &report.downloaded {
            self.record(
                file.identifier,
                ItemStatus::Succeeded,
                format!("downloaded {:.1} MB", file.size_bytes as f64 / 1_048_576.0),
            );
        }
        for file in &report.skipped {
            self.record(file.identifier, ItemStatus::Skipped, "valid local copy".into());
        }
        for failure in &report.failed {
            self.record(
                failure.identifier,
                ItemStatus::Failed,
                format!("fetch {}: {}", failure.error.kind(), failure.error),
            );
        }
    }

    fn record_load(&mut self, report: &LoadReport) {
        for outcome in &report.outcomes {
            let (status, detail) = match &outcome.status {
                BatchStatus::Loaded(batch) => {
                    let mut detail = format!("{} rows loaded, {} rejected", batch.row_count, batch.rejected_count);
                    if batch.replaced_rows > 0 {
                        detail.push_str(&format!(", {} replaced", batch.replaced_rows));
                    }
                    (ItemStatus::Succeeded, detail)
                }
                BatchStatus::Skipped(batch) => (
                    ItemStatus::Skipped,
                    format!("already loaded at {}", batch.loaded_at.format("%Y-%m-%d %H:%M:%S UTC")),
                ),
                BatchStatus::Failed(error) => {
                    (ItemStatus::Failed, format!("load {}: {}", error.kind(), error))
                }
            };
            self.record(outcome.identifier, status, detail);
        }
    }

    fn count(&self, status: ItemStatus) -> usize {
        self.lines.values().filter(|l| l.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(ItemStatus::Succeeded)
    }

    pub fn skipped(&self) -> usize {
        self.count(ItemStatus::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(ItemStatus::Failed)
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    pub fn get(&self, id: &DatasetIdentifier) -> Option<&SummaryLine> {
        self.lines.get(id)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, line) in &self.lines {
            let icon = match line.status {
                ItemStatus::Succeeded => "✅",
                ItemStatus::Skipped => "⏭️ ",
                ItemStatus::Failed => "❌",
            };
            writeln!(f, "   {} {}  {}", icon, id, line.detail)?;
        }
        write!(
            f,
            "   succeeded: {}, skipped: {}, failed: {}",
            self.succeeded(),
            self.skipped(),
            self.failed()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::pipeline::fetcher::FetchFailure;
    use crate::pipeline::loader::BatchOutcome;
    use crate::pipeline::local_file::LocalFile;
    use crate::types::LoadedBatch;
    use chrono::Utc;
    use std::path::PathBuf;

    fn id(s: &str) -> DatasetIdentifier {
        s.parse().unwrap()
    }

    fn file(s: &str) -> LocalFile {
        LocalFile {
            identifier: id(s),
            dataset: "yellow_tripdata".into(),
            path: PathBuf::from(s),
            size_bytes: 2 * 1_048_576,
            marker: None,
        }
    }

    #[test]
    fn test_load_outcome_overrides_fetch() {
        let fetch = FetchReport {
            downloaded: vec![file("2024-01")],
            skipped: vec![file("2024-02")],
            failed: vec![FetchFailure {
                identifier: id("2024-03"),
                error: IngestError::HttpStatus { url: "u".into(), status: 404 },
            }],
        };
        let batch = LoadedBatch {
            batch_key: "yellow_tripdata_2024-02".into(),
            identifier: id("2024-02"),
            row_count: 10,
            rejected_count: 1,
            replaced_rows: 0,
            loaded_at: Utc::now(),
            run_id: "r".into(),
        };
        let load = LoadReport {
            run_id: "r".into(),
            outcomes: vec![
                BatchOutcome {
                    identifier: id("2024-01"),
                    batch_key: "yellow_tripdata_2024-01".into(),
                    status: BatchStatus::Skipped(batch.clone()),
                    accepted: 0,
                    rejected: 0,
                    rejections: BTreeMap::new(),
                    revision: None,
                },
                BatchOutcome {
                    identifier: id("2024-02"),
                    batch_key: batch.batch_key.clone(),
                    status: BatchStatus::Loaded(batch),
                    accepted: 10,
                    rejected: 1,
                    rejections: BTreeMap::new(),
                    revision: Some("yellow_2011"),
                },
            ],
        };

        let summary = RunSummary::from_run(&fetch, &load);
        assert_eq!(summary.get(&id("2024-01")).unwrap().status, ItemStatus::Skipped);
        assert_eq!(summary.get(&id("2024-02")).unwrap().status, ItemStatus::Succeeded);
        assert_eq!(summary.get(&id("2024-03")).unwrap().status, ItemStatus::Failed);
        assert_eq!((summary.succeeded(), summary.skipped(), summary.failed()), (1, 1, 1));
        assert!(summary.has_failures());

        let rendered = summary.to_string();
        assert!(rendered.contains("2024-02"));
        assert!(rendered.contains("10 rows loaded, 1 rejected"));
    }

    #[test]
    fn test_fetch_only_summary() {
        let fetch = FetchReport { downloaded: vec![file("2024-01")], skipped: vec![], failed: vec![] };
        let summary = RunSummary::from_fetch(&fetch);
        assert_eq!(summary.get(&id("2024-01")).unwrap().detail, "downloaded 2.0 MB");
        assert!(!summary.has_failures());
    }
}

//! Metric names and recording helpers for the fetch and load phases.
//!
//! Recording goes through the `metrics` facade. Without an installed
//! recorder every call is a no-op, so library users opt in by installing
//! their own exporter.

use std::fmt;

/// Every metric emitted by the ingest pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Fetch metrics
    FetchDownloaded,
    FetchSkipped,
    FetchFailed,
    FetchRetries,
    FetchBytes,
    FetchDuration,

    // Load metrics
    LoadBatchesLoaded,
    LoadBatchesSkipped,
    LoadBatchesFailed,
    LoadRowsAccepted,
    LoadRowsRejected,
    LoadRowsReplaced,
    LoadDuration,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::FetchDownloaded => "nyc_taxi_fetch_downloaded_total",
            MetricName::FetchSkipped => "nyc_taxi_fetch_skipped_total",
            MetricName::FetchFailed => "nyc_taxi_fetch_failed_total",
            MetricName::FetchRetries => "nyc_taxi_fetch_retries_total",
            MetricName::FetchBytes => "nyc_taxi_fetch_bytes",
            MetricName::FetchDuration => "nyc_taxi_fetch_duration_seconds",

            MetricName::LoadBatchesLoaded => "nyc_taxi_load_batches_loaded_total",
            MetricName::LoadBatchesSkipped => "nyc_taxi_load_batches_skipped_total",
            MetricName::LoadBatchesFailed => "nyc_taxi_load_batches_failed_total",
            MetricName::LoadRowsAccepted => "nyc_taxi_load_rows_accepted_total",
            MetricName::LoadRowsRejected => "nyc_taxi_load_rows_rejected_total",
            MetricName::LoadRowsReplaced => "nyc_taxi_load_rows_replaced_total",
            MetricName::LoadDuration => "nyc_taxi_load_duration_seconds",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Fetch Metrics
// ============================================================================

pub mod fetch {
    use super::MetricName;

    pub fn downloaded(bytes: u64, secs: f64) {
        ::metrics::counter!(MetricName::FetchDownloaded.as_str()).increment(1);
        ::metrics::histogram!(MetricName::FetchBytes.as_str()).record(bytes as f64);
        ::metrics::histogram!(MetricName::FetchDuration.as_str()).record(secs);
    }

    pub fn skipped() {
        ::metrics::counter!(MetricName::FetchSkipped.as_str()).increment(1);
    }

    pub fn failed(error_kind: &'static str) {
        ::metrics::counter!(MetricName::FetchFailed.as_str(), "kind" => error_kind).increment(1);
    }

    pub fn retried() {
        ::metrics::counter!(MetricName::FetchRetries.as_str()).increment(1);
    }
}

// ============================================================================
// Load Metrics
// ============================================================================

pub mod load {
    use super::MetricName;

    pub fn batch_loaded(accepted: u64, rejected: u64, replaced: u64, secs: f64) {
        ::metrics::counter!(MetricName::LoadBatchesLoaded.as_str()).increment(1);
        ::metrics::counter!(MetricName::LoadRowsAccepted.as_str()).increment(accepted);
        ::metrics::counter!(MetricName::LoadRowsRejected.as_str()).increment(rejected);
        ::metrics::counter!(MetricName::LoadRowsReplaced.as_str()).increment(replaced);
        ::metrics::histogram!(MetricName::LoadDuration.as_str()).record(secs);
    }

    pub fn batch_skipped() {
        ::metrics::counter!(MetricName::LoadBatchesSkipped.as_str()).increment(1);
    }

    pub fn batch_failed(error_kind: &'static str) {
        ::metrics::counter!(MetricName::LoadBatchesFailed.as_str(), "kind" => error_kind).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_prefixed() {
        let names = [
            MetricName::FetchDownloaded,
            MetricName::FetchFailed,
            MetricName::LoadRowsRejected,
            MetricName::LoadDuration,
        ];
        for name in names {
            assert!(name.as_str().starts_with("nyc_taxi_"));
            assert_eq!(name.to_string(), name.as_str());
        }
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        fetch::downloaded(1024, 0.5);
        fetch::failed("network");
        load::batch_loaded(10, 1, 0, 0.1);
        load::batch_failed("store_write");
    }
}

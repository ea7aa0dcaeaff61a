use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("network failure fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("unexpected HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("download validation failed for {file}: {reason}")]
    Validation { file: String, reason: String },

    #[error("schema mismatch in {file}: {reason}")]
    SchemaMismatch { file: String, reason: String },

    #[error("store write failed for batch {batch_key}: {source}")]
    StoreWrite {
        batch_key: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("no trip store at {path}: {reason}")]
    StoreNotFound { path: String, reason: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Parquet decoding failed: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow conversion failed: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("invalid dataset identifier: {0}")]
    InvalidIdentifier(String),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("worker task failed: {0}")]
    Task(String),
}

impl IngestError {
    /// Transport failures and throttling/server statuses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Network { .. } => true,
            IngestError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Short taxonomy label used in run summaries and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Network { .. } | IngestError::HttpStatus { .. } => "network",
            IngestError::Validation { .. } => "validation",
            IngestError::SchemaMismatch { .. } => "schema_mismatch",
            IngestError::StoreWrite { .. } | IngestError::Sqlite(_) => "store_write",
            IngestError::StoreNotFound { .. } => "store_missing",
            IngestError::Parquet(_) | IngestError::Arrow(_) => "decode",
            IngestError::InvalidIdentifier(_) => "invalid_identifier",
            IngestError::Json(_) | IngestError::Toml(_) | IngestError::Config(_) => "config",
            IngestError::Io(_) => "io",
            IngestError::Task(_) => "task",
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        let url = "https://example.com/x.parquet".to_string();
        assert!(IngestError::HttpStatus { url: url.clone(), status: 503 }.is_retryable());
        assert!(IngestError::HttpStatus { url: url.clone(), status: 429 }.is_retryable());
        assert!(!IngestError::HttpStatus { url: url.clone(), status: 404 }.is_retryable());
        assert!(IngestError::Network { url, message: "reset".into() }.is_retryable());
        assert!(!IngestError::Config("bad".into()).is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        let file = "yellow_tripdata_2024-01.parquet".to_string();
        let cases = [
            (IngestError::HttpStatus { url: file.clone(), status: 404 }, "network"),
            (IngestError::Validation { file: file.clone(), reason: "empty".into() }, "validation"),
            (IngestError::SchemaMismatch { file: file.clone(), reason: "?".into() }, "schema_mismatch"),
            (IngestError::StoreNotFound { path: "typo.sqlite".into(), reason: "missing".into() }, "store_missing"),
            (IngestError::InvalidIdentifier("2024-13".into()), "invalid_identifier"),
            (IngestError::Task("panicked".into()), "task"),
        ];
        for (error, kind) in cases {
            assert_eq!(error.kind(), kind, "{}", error);
        }
    }
}

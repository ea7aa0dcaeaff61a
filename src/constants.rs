//! Defaults shared by the fetcher, the loader and the CLI.

// Public TLC trip-record bucket
pub const DEFAULT_BASE_URL: &str = "https://d37ci6vzurychx.cloudfront.net/trip-data";

// File family; files are named `{dataset}_{YYYY-MM}.parquet`
pub const DEFAULT_DATASET: &str = "yellow_tripdata";

pub const PARQUET_EXTENSION: &str = "parquet";
pub const PARTIAL_SUFFIX: &str = "part";
pub const SIDECAR_SUFFIX: &str = "meta.json";

/// First year the TLC publishes trip records for.
pub const FIRST_PUBLISHED_YEAR: i32 = 2009;

pub const DEFAULT_DATA_DIR: &str = "data/raw";
pub const DEFAULT_DATABASE_PATH: &str = "data/taxi.sqlite";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

pub const DEFAULT_FETCH_CONCURRENCY: u32 = 4;
pub const DEFAULT_LOAD_CONCURRENCY: u32 = 4;
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Rows decoded per Arrow record batch.
pub const READ_BATCH_SIZE: usize = 8192;

/// Parquet files start and end with these magic bytes.
pub const PARQUET_MAGIC: &[u8; 4] = b"PAR1";

// Storage format for naive TLC wall-clock times
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

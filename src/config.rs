use crate::constants::*;
use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Run configuration, passed explicitly to the fetcher and loader.
///
/// Resolution order: built-in defaults, then `config.toml`, then `NYC_TAXI_*`
/// environment variables, then CLI flags (applied by the binary).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub storage: StorageConfig,
    pub load: LoadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub dataset: String,
    /// Cap on simultaneous downloads.
    pub concurrency: u32,
    pub requests_per_min: Option<u64>,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub connect_timeout_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            dataset: DEFAULT_DATASET.to_string(),
            concurrency: DEFAULT_FETCH_CONCURRENCY,
            requests_per_min: None,
            retries: DEFAULT_RETRIES,
            retry_backoff_ms: 500,
            connect_timeout_seconds: DEFAULT_CONNECT_TIMEOUT_SECS,
            timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl SourceConfig {
    pub fn url_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), file_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Destination directory for downloaded files.
    pub data_dir: PathBuf,
    /// SQLite database file; the store "connection string".
    pub database_path: PathBuf,
    pub busy_timeout_ms: u64,
    pub log_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            log_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub concurrency: u32,
    pub force_reload: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_LOAD_CONCURRENCY,
            force_reload: false,
        }
    }
}

impl Config {
    /// Load from `path`, or from `config.toml` when present, then apply
    /// environment overrides. An explicit path that cannot be read is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply `NYC_TAXI_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NYC_TAXI_BASE_URL") {
            self.source.base_url = v;
        }
        if let Some(v) = lookup("NYC_TAXI_DATASET") {
            self.source.dataset = v;
        }
        if let Some(v) = lookup("NYC_TAXI_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("NYC_TAXI_DATABASE") {
            self.storage.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("NYC_TAXI_FETCH_CONCURRENCY") {
            self.source.concurrency = parse_env("NYC_TAXI_FETCH_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("NYC_TAXI_LOAD_CONCURRENCY") {
            self.load.concurrency = parse_env("NYC_TAXI_LOAD_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("NYC_TAXI_FORCE_RELOAD") {
            self.load.force_reload = v == "1" || v.eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.source.base_url.starts_with("http://") && !self.source.base_url.starts_with("https://") {
            return Err(IngestError::Config(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.source.base_url
            )));
        }
        if self.source.dataset.trim().is_empty() {
            return Err(IngestError::Config("dataset must not be empty".into()));
        }
        if self.source.concurrency == 0 || self.load.concurrency == 0 {
            return Err(IngestError::Config("concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| IngestError::Config(format!("{} has an invalid value '{}'", key, value)))
}

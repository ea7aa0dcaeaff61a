// Fetch and load stages, plus the on-disk contract between them

pub mod fetcher;
pub mod loader;
pub mod local_file;
pub mod rate_limiter;
pub mod reader;
pub mod schema;
pub mod summary;

pub use fetcher::{FetchReport, Fetcher};
pub use loader::{BatchStatus, LoadReport, Loader};
pub use local_file::LocalFile;
pub use summary::RunSummary;

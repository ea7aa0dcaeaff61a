use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "nyc_taxi_ingest=info,warn";
const LOG_FILE_PREFIX: &str = "ingest.log";

/// Install the global subscriber: readable lines on stdout and JSON lines in a
/// daily-rotated file under `log_dir`. `RUST_LOG` replaces the default filter.
///
/// Buffered file output is flushed when the returned guard drops, so the
/// caller keeps it alive for the whole run.
pub fn init_logging(log_dir: &Path) -> io::Result<WorkerGuard> {
    fs::create_dir_all(log_dir)?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX));

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_current_span(true).with_writer(file_writer))
        .with(fmt::layer().with_target(false).with_writer(io::stdout))
        .init();

    Ok(guard)
}

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use nyc_taxi_ingest::config::Config;
use nyc_taxi_ingest::logging::init_logging;
use nyc_taxi_ingest::pipeline::local_file::LocalCopy;
use nyc_taxi_ingest::pipeline::{Fetcher, LocalFile, Loader, RunSummary};
use nyc_taxi_ingest::storage::TripStore;
use nyc_taxi_ingest::types::DatasetIdentifier;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "nyc_taxi_ingest")]
#[command(about = "Fetch NYC TLC trip-record files and load them idempotently into SQLite")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory for downloaded source files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// SQLite database file
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download source files for the selected months
    Fetch {
        #[command(flatten)]
        months: MonthSelection,
    },
    /// Load local files into the store (all discovered files by default)
    Load {
        #[command(flatten)]
        months: MonthSelection,
        /// Replace batches that are already loaded
        #[arg(long)]
        force_reload: bool,
    },
    /// Fetch, then load, the selected months
    Run {
        #[command(flatten)]
        months: MonthSelection,
        #[arg(long)]
        force_reload: bool,
    },
    /// Print store statistics
    Stats,
}

#[derive(Args, Debug)]
struct MonthSelection {
    /// Comma-separated months, e.g. 2024-01,2024-02
    #[arg(long, value_delimiter = ',', conflicts_with_all = ["from", "to", "year"])]
    months: Vec<DatasetIdentifier>,
    /// First month of an inclusive range
    #[arg(long, requires = "to")]
    from: Option<DatasetIdentifier>,
    /// Last month of an inclusive range
    #[arg(long, requires = "from")]
    to: Option<DatasetIdentifier>,
    /// Every published month of a year
    #[arg(long, conflicts_with_all = ["from", "to"])]
    year: Option<i32>,
}

impl MonthSelection {
    fn resolve(&self) -> anyhow::Result<Option<Vec<DatasetIdentifier>>> {
        if !self.months.is_empty() {
            return Ok(Some(self.months.clone()));
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            return Ok(Some(DatasetIdentifier::range(from, to)?));
        }
        if let Some(year) = self.year {
            return Ok(Some(DatasetIdentifier::available_in_year(year, Utc::now().date_naive())?));
        }
        Ok(None)
    }

    fn require(&self) -> anyhow::Result<Vec<DatasetIdentifier>> {
        match self.resolve()? {
            Some(ids) => Ok(ids),
            None => bail!("select months with --months, --from/--to or --year"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }
    if let Some(db) = cli.database {
        config.storage.database_path = db;
    }

    let _log_guard = init_logging(&config.storage.log_dir)
        .with_context(|| format!("creating log directory {}", config.storage.log_dir.display()))?;
    info!(
        data_dir = %config.storage.data_dir.display(),
        database = %config.storage.database_path.display(),
        dataset = %config.source.dataset,
        "starting"
    );

    let summary = match cli.command {
        Commands::Fetch { months } => {
            let ids = months.require()?;
            println!("📥 Fetching {} file(s)...", ids.len());
            let fetcher = Fetcher::with_reqwest(config.source.clone())?;
            let report = fetcher.fetch(&ids, &config.storage.data_dir).await?;
            RunSummary::from_fetch(&report)
        }
        Commands::Load { months, force_reload } => {
            config.load.force_reload |= force_reload;
            let (files, unusable) = match months.resolve()? {
                Some(ids) => select_local_files(&config, &ids)?,
                None => (
                    LocalFile::discover(&config.storage.data_dir, &config.source.dataset)?,
                    Vec::new(),
                ),
            };
            println!("🗄️  Loading {} file(s)...", files.len());
            let loader = Loader::new(&config.storage, &config.load);
            let report = loader.load(&files).await?;
            let mut summary = RunSummary::from_load(&report);
            for (id, reason) in unusable {
                summary.record_failure(id, reason);
            }
            summary
        }
        Commands::Run { months, force_reload } => {
            config.load.force_reload |= force_reload;
            let ids = months.require()?;
            println!("📥 Step 1: fetching {} file(s)...", ids.len());
            let fetcher = Fetcher::with_reqwest(config.source.clone())?;
            let fetched = fetcher.fetch(&ids, &config.storage.data_dir).await?;

            let files = fetched.files();
            println!("🗄️  Step 2: loading {} file(s)...", files.len());
            let loader = Loader::new(&config.storage, &config.load);
            let loaded = loader.load(&files).await?;
            RunSummary::from_run(&fetched, &loaded)
        }
        Commands::Stats => {
            print_stats(&config)?;
            return Ok(ExitCode::SUCCESS);
        }
    };

    println!("\n📊 Summary:");
    println!("{}", summary);
    if summary.has_failures() {
        println!("\n⚠️  {} identifier(s) failed", summary.failed());
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Valid local copies for `ids`, plus the identifiers that have none.
fn select_local_files(
    config: &Config,
    ids: &[DatasetIdentifier],
) -> anyhow::Result<(Vec<LocalFile>, Vec<(DatasetIdentifier, String)>)> {
    let mut files = Vec::with_capacity(ids.len());
    let mut unusable = Vec::new();
    for id in ids {
        match LocalFile::inspect(&config.storage.data_dir, &config.source.dataset, id)? {
            LocalCopy::Valid(file) => files.push(file),
            LocalCopy::Missing => {
                warn!(identifier = %id, "no local file, run fetch first");
                unusable.push((*id, "no local file".to_string()));
            }
            LocalCopy::Invalid { path, reason } => {
                warn!(identifier = %id, path = %path.display(), %reason, "invalid local file");
                unusable.push((*id, format!("invalid local file: {}", reason)));
            }
        }
    }
    Ok((files, unusable))
}

fn print_stats(config: &Config) -> anyhow::Result<()> {
    let store = TripStore::open_existing(
        &config.storage.database_path,
        Duration::from_millis(config.storage.busy_timeout_ms),
    )?;
    let stats = store.statistics()?;

    println!("📊 Store: {}", store.path().display());
    println!("   Total trips: {}", stats.total_trips);
    println!("   Batches loaded: {}", stats.batches_loaded);
    match (stats.first_pickup, stats.last_pickup) {
        (Some(first), Some(last)) => println!("   Pickup range: {} .. {}", first, last),
        _ => println!("   Pickup range: (empty)"),
    }
    println!("   Database size: {:.1} MB", stats.database_bytes as f64 / 1_048_576.0);

    let periods = store.period_counts()?;
    if !periods.is_empty() {
        println!("\n   Trips per period:");
        for (period, count) in periods {
            println!("     {}  {}", period, count);
        }
    }
    let batches = store.batches()?;
    if !batches.is_empty() {
        println!("\n   Batches:");
        for batch in batches {
            println!(
                "     {}  {} rows, {} rejected, loaded {}",
                batch.batch_key,
                batch.row_count,
                batch.rejected_count,
                batch.loaded_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }
    Ok(())
}

//! Command-line interface for `wfsfetch`, a memory-bounded WFS downloader.
//!
//! This binary provides a thin façade over the [`wfsfetch_core`] library:
//! it parses arguments, configures logging, runs one fetch session and
//! reports the resulting dataset.
//!
//! # Available Commands
//!
//! - `fetch` - Download every feature matching a query, optionally to Parquet
//! - `url` - Print the GetFeature URL a query would request

mod display;
mod output;

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

use wfsfetch_core::options::DEFAULT_PAGE_SIZE;
use wfsfetch_core::{
    BoundingBox, FeatureQuery, FetchOptions, MemoryPolicy, PageRequest, WfsFetchError, WfsOptions,
    WfsQueryExecutor, get_data, request_url,
};

#[derive(Parser)]
#[command(
    name = "wfsfetch",
    version,
    about = "Memory-bounded paginated WFS downloads",
    long_about = "wfsfetch pages through a WFS GetFeature endpoint, spills accumulated features\n\
                  to Parquet under memory pressure, and assembles one geospatial dataset."
)]
/// Command-line arguments and options for the `wfsfetch` CLI.
struct Cli {
    /// Enable verbose (INFO level) logging output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug (DEBUG level) logging output with detailed diagnostics.
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Query and service flags shared by every subcommand.
#[derive(Args, Debug)]
struct QueryArgs {
    /// Dataset identifier, e.g. `WHSE_IMAGERY_AND_BASE_MAPS.GSR_AIRPORTS_SVW`.
    #[arg(long, value_name = "ID")]
    dataset: String,

    /// CQL filter expression.
    #[arg(long, value_name = "CQL")]
    filter: Option<String>,

    /// Comma-separated attribute names to return.
    #[arg(long, value_name = "FIELDS", value_delimiter = ',')]
    fields: Vec<String>,

    /// Bounding box `x1,y1,x2,y2[,crs]` in service units.
    #[arg(long, value_name = "BBOX", allow_hyphen_values = true)]
    bbox: Option<BoundingBox>,

    /// Features requested per page.
    #[arg(long, value_name = "N", default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u64,

    /// WFS endpoint.
    #[arg(long, value_name = "URL")]
    service_url: Option<String>,

    /// CRS the service should return features in.
    #[arg(long, value_name = "CRS")]
    srs_name: Option<String>,
}

impl QueryArgs {
    fn query(&self) -> FeatureQuery {
        let mut query = FeatureQuery::new(&self.dataset).with_fields(self.fields.iter().cloned());
        if let Some(filter) = &self.filter {
            query = query.with_filter(filter.clone());
        }
        if let Some(bbox) = &self.bbox {
            query = query.with_bbox(bbox.clone());
        }
        query
    }

    fn wfs_options(&self) -> WfsOptions {
        let mut options = WfsOptions::default();
        if let Some(url) = &self.service_url {
            options = options.with_service_url(url.clone());
        }
        if let Some(srs_name) = &self.srs_name {
            options = options.with_srs_name(srs_name.clone());
        }
        options
    }
}

/// Available subcommands for the `wfsfetch` CLI.
#[derive(Subcommand)]
enum Commands {
    /// Downloads every feature matching the query.
    Fetch {
        #[command(flatten)]
        query: QueryArgs,

        /// Parent directory for the session spill directory.
        #[arg(long, value_name = "DIR")]
        spill_dir: Option<PathBuf>,

        /// Memory (MiB) that must stay available before features are spilled.
        #[arg(long, value_name = "MB")]
        memory_reserve_mb: Option<u64>,

        /// Write the dataset to this Parquet file.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Prints the GetFeature URL for one page without sending it.
    Url {
        #[command(flatten)]
        query: QueryArgs,

        /// Offset of the page.
        #[arg(long, value_name = "N")]
        start_index: Option<u64>,
    },
}

/// Entry point for the `wfsfetch` command-line interface.
///
/// # Errors
///
/// Returns an error if command execution fails or if the logging system cannot be initialized.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };

    // Bridge logs from the `log` crate to the `tracing` ecosystem.
    LogTracer::init()?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Fetch {
            query,
            spill_dir,
            memory_reserve_mb,
            output,
        } => {
            handle_fetch(&query, spill_dir, memory_reserve_mb, output).await?;
        },
        Commands::Url { query, start_index } => {
            let url = handle_url(&query, start_index)?;
            println!("{url}");
        },
    }

    Ok(())
}

async fn handle_fetch(
    args: &QueryArgs,
    spill_dir: Option<PathBuf>,
    memory_reserve_mb: Option<u64>,
    output: Option<PathBuf>,
) -> Result<()> {
    info!("Fetch command:");
    info!("Dataset: {}", args.dataset);

    let mut options = FetchOptions::new().with_page_size(args.page_size);
    if let Some(dir) = spill_dir {
        options = options.with_spill_dir(dir);
    }
    if let Some(mb) = memory_reserve_mb {
        options = options.with_memory_policy(MemoryPolicy {
            reserve_bytes: mb.saturating_mul(1024 * 1024),
        });
    }

    let executor = WfsQueryExecutor::new(args.wfs_options());
    let dataset = get_data(&executor, args.query(), options)
        .await
        .map_err(describe)?;

    display::display_dataset_summary(&args.dataset, &dataset);

    if let Some(path) = output {
        output::write_parquet(&dataset, &path)?;
        println!("\nWrote {}", path.display());
    }
    Ok(())
}

fn handle_url(args: &QueryArgs, start_index: Option<u64>) -> Result<String> {
    let page = PageRequest {
        start_index,
        count: Some(args.page_size),
    };
    let url = request_url(&args.query(), page, &args.wfs_options()).map_err(describe)?;
    Ok(url.to_string())
}

fn describe(err: WfsFetchError) -> anyhow::Error {
    if err.is_recoverable() {
        warn!("This failure may not recur if the command is run again");
    }
    match err.recovery_suggestion() {
        Some(hint) => anyhow!("{}\nHint: {hint}", err.user_message()),
        None => anyhow!(err.user_message()),
    }
}

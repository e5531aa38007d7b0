//! `ingest`: catalog-driven dataset ingestion.
//! Fetches every catalogued source, validates it against its column contract and merges
//! it into the tabular data files. See `DESIGN.md` for the pipeline layout.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use dataset_ingest::catalog::load_catalog;
use dataset_ingest::index::write_index;
use dataset_ingest::ingest::config::load_config_default;
use dataset_ingest::ingest::fetch::HttpFetcher;
use dataset_ingest::metrics::Metrics;
use dataset_ingest::init_tracing;

/// Exit code for catalog and configuration problems.
const EXIT_USAGE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "ingest", version, about = "Catalog-driven dataset ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch, validate and merge catalogued datasets.
    Run(RunArgs),
    /// Load and validate the catalog without fetching anything.
    Check {
        #[arg(long)]
        catalog: PathBuf,
    },
    /// Regenerate catalog.json from the data directory and its sidecars.
    RebuildIndex {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Defaults to `catalog.json` next to the data directory.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    catalog: PathBuf,
    /// Restrict the run to these dataset ids (repeatable). Selected manual datasets are fetched.
    #[arg(long = "only", value_name = "ID")]
    only: Vec<String>,
    /// Replace rows whose natural key already exists.
    #[arg(long)]
    overwrite: bool,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Per-attempt fetch timeout.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Whole-run fetch deadline; 0 disables it.
    #[arg(long)]
    run_timeout_secs: Option<u64>,
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    format: ReportFormat,
    /// Write Prometheus exposition text here after the run.
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
}

/// Failure that ends the process with a specific exit code.
struct AppError {
    code: u8,
    err: anyhow::Error,
}

impl AppError {
    fn usage(err: impl Into<anyhow::Error>) -> Self {
        Self {
            code: EXIT_USAGE,
            err: err.into(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self { code: 1, err }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env for local runs; absent file is fine.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let res = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Check { catalog } => check(&catalog),
        Command::RebuildIndex { data_dir, out } => rebuild_index(&data_dir, out),
    };

    match res {
        Ok(code) => ExitCode::from(code),
        Err(AppError { code, err }) => {
            tracing::error!(target: "ingest", error = %err, "ingest failed");
            eprintln!("error: {err:#}");
            ExitCode::from(code)
        }
    }
}

async fn run(args: RunArgs) -> Result<u8, AppError> {
    let mut cfg = load_config_default().map_err(AppError::usage)?;
    // CLI flags override file and env.
    if args.overwrite {
        cfg.overwrite = true;
    }
    if let Some(n) = args.concurrency {
        cfg.concurrency = n.max(1);
    }
    if let Some(s) = args.timeout_secs {
        cfg.timeout = Duration::from_secs(s.max(1));
    }
    if let Some(s) = args.run_timeout_secs {
        cfg.run_timeout = (s > 0).then(|| Duration::from_secs(s));
    }

    let metrics = match &args.metrics_file {
        Some(_) => Some(Metrics::install(cfg.concurrency)?),
        None => None,
    };

    let catalog = load_catalog(&args.catalog).map_err(AppError::usage)?;
    let fetcher = Arc::new(HttpFetcher::new(&cfg)?);
    let report = dataset_ingest::run(&catalog, &args.only, &cfg, fetcher)
        .await
        .map_err(AppError::usage)?;

    match args.format {
        ReportFormat::Text => print!("{}", report.render_text()),
        ReportFormat::Json => println!(
            "{}",
            report.to_json().context("serializing run report")?
        ),
    }

    if let (Some(m), Some(path)) = (&metrics, &args.metrics_file) {
        m.write_to(path)?;
    }
    Ok(report.exit_code())
}

fn check(path: &Path) -> Result<u8, AppError> {
    let catalog = load_catalog(path).map_err(AppError::usage)?;
    println!(
        "{}: {} datasets OK",
        catalog.path.display(),
        catalog.datasets.len()
    );
    for d in &catalog.datasets {
        println!(
            "  {:<24} {:<8} {}",
            d.id,
            d.cadence.as_str(),
            d.target.display()
        );
    }
    Ok(0)
}

fn rebuild_index(data_dir: &Path, out: Option<PathBuf>) -> Result<u8, AppError> {
    if !data_dir.is_dir() {
        return Err(AppError::usage(anyhow::anyhow!(
            "data directory {} does not exist",
            data_dir.display()
        )));
    }
    let out = out.unwrap_or_else(|| {
        data_dir
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join("catalog.json")
    });
    let index = write_index(data_dir, &out)?;
    println!(
        "wrote {} ({} datasets)",
        out.display(),
        index.total_datasets
    );
    Ok(0)
}

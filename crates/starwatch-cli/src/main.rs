use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{ArgAction, Args, Parser, Subcommand};
use starwatch_core::MetricKey;
use starwatch_sync::{
    render_brief, render_trend_table, report_runs_markdown, trends_from_history, Pipeline,
    RunRequest, WatchConfig, WatchList,
};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "starwatch")]
#[command(about = "Track CMS nursing home star ratings and alert on changes")]
struct Cli {
    /// More log output (-v debug); RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the latest snapshot, merge it into history and report changes.
    Run(RunArgs),
    /// Summarize persisted history over a trailing window without fetching.
    Trends(TrendArgs),
    /// List the most recent run reports.
    Runs {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

#[derive(Debug, Default, Args)]
struct WatchArgs {
    /// Facility CCN to watch; repeatable. Nothing given watches every facility.
    #[arg(long = "ccn", value_name = "CCN")]
    ccns: Vec<String>,
    /// File with one CCN per line.
    #[arg(long, value_name = "PATH")]
    ccn_file: Option<PathBuf>,
}

impl WatchArgs {
    fn watch_list(&self) -> Result<WatchList> {
        let mut list = WatchList::from_ids(&self.ccns).context("invalid --ccn")?;
        if let Some(path) = &self.ccn_file {
            list = list.merged(WatchList::load(path)?);
        }
        Ok(list)
    }
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    #[command(flatten)]
    watch: WatchArgs,
    /// Include trailing-window trend summaries.
    #[arg(long)]
    trends: bool,
    /// Send change alerts through the configured channels.
    #[arg(long)]
    notify: bool,
    /// Skip writing the report directory.
    #[arg(long)]
    no_report: bool,
    /// Detect and report without saving the snapshot into history.
    #[arg(long)]
    dry_run: bool,
    #[arg(long, value_name = "SECS")]
    deadline_secs: Option<u64>,
    /// Read snapshots from a local metadata file instead of CMS.
    #[arg(long, value_name = "PATH")]
    fixture: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct TrendArgs {
    #[command(flatten)]
    watch: WatchArgs,
    #[arg(long, value_name = "DAYS")]
    window_days: Option<u32>,
    /// Window end date (YYYY-MM-DD); defaults to the latest snapshot on record.
    #[arg(long, value_name = "DATE")]
    as_of: Option<NaiveDate>,
    /// Metric key to summarize; repeatable. Defaults to every metric on record.
    #[arg(long = "metric", value_name = "KEY")]
    metrics: Vec<String>,
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default_level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, _) => "debug",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let outcome = match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(args).await,
        Commands::Trends(args) => trends(args),
        Commands::Runs { count } => runs(count),
    };
    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let mut config = WatchConfig::from_env();
    if let Some(path) = args.fixture {
        config.fixture_metadata = Some(path);
    }
    if let Some(secs) = args.deadline_secs {
        config.run_deadline_secs = Some(secs);
    }
    let watch = args.watch.watch_list()?;
    let pipeline = Pipeline::from_config(config).context("building pipeline")?;

    let mut request = RunRequest::from_config(pipeline.config(), watch);
    request.include_trends = args.trends;
    request.notify = args.notify;
    request.write_reports = !args.no_report;
    request.dry_run = args.dry_run;

    match pipeline.run_once(&request).await {
        Ok(report) => {
            println!("{}", render_brief(&report));
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            error!(stage = %failure.stage(), error = %failure, "run failed");
            eprintln!("run failed: {failure}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn trends(args: TrendArgs) -> Result<ExitCode> {
    let config = WatchConfig::from_env();
    let watch = args.watch.watch_list()?;
    let window = args
        .window_days
        .map(|days| chrono::Duration::days(i64::from(days)))
        .unwrap_or_else(|| config.trend_window());
    let metrics: Vec<MetricKey> = args.metrics.iter().map(MetricKey::new).collect();

    let summaries = trends_from_history(&config.history_path, &watch, &metrics, window, args.as_of)
        .with_context(|| format!("reading history {}", config.history_path.display()))?;
    if summaries.is_empty() {
        println!("No rating history in the requested window.");
    } else {
        println!("{}", render_trend_table(&summaries));
    }
    Ok(ExitCode::SUCCESS)
}

fn runs(count: usize) -> Result<ExitCode> {
    let config = WatchConfig::from_env();
    println!("{}", report_runs_markdown(&config.reports_dir, count)?);
    Ok(ExitCode::SUCCESS)
}

mod config;
mod export;
mod models;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::pipeline::reconcile::Reconciler;
use crate::pipeline::Pipeline;
use crate::scraper::rate_limit::{RateGate, RateLimited};
use crate::scraper::{HttpReportSource, ReportSource};
use crate::storage::Repository;
use crate::utils::{date_key, DateRange};

#[derive(Parser)]
#[command(name = "aqi-ingest", about = "National daily air-quality report ingestion", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Download every day's report into the database
    Ingest {
        /// First day (default: pipeline.ingest_start)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Stop before this day (default: today)
        #[arg(long)]
        until: Option<NaiveDate>,
    },

    /// List days whose stored count differs from the source's total
    Audit {
        /// First day (default: pipeline.audit_start)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Stop before this day (default: today)
        #[arg(long)]
        until: Option<NaiveDate>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show database statistics
    Stats,

    /// Write one day's stored readings as CSV
    Export {
        /// Day to export (YYYY-MM-DD)
        #[arg(long)]
        date: NaiveDate,
        /// Output file (default: stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Apply schema migrations without loading data
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "aqi_ingest=info,warn",
        1 => "aqi_ingest=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;
    let today = Local::now().date_naive();

    match cli.command {
        Command::Ingest { from, until } => {
            let t = utils::Timer::start("Ingest");
            let range = DateRange::new(
                from.unwrap_or(config.pipeline.ingest_start),
                until.unwrap_or(today),
            );
            if range.is_empty() {
                warn!("Nothing to ingest: empty date range");
                return Ok(());
            }
            let repo = open_repo(&config)?;
            let run_id = repo.begin_ingest_run().context("Failed to record ingest run")?;

            let pipeline = Pipeline::new(
                report_source(&config)?,
                repo.clone(),
                config.pipeline.concurrency,
            );
            let stats = pipeline.run(range).await;

            let error = (stats.failed() > 0).then(|| format!("{} days failed", stats.failed()));
            if let Err(e) = repo.finish_ingest_run(
                run_id,
                stats.days,
                stats.failed(),
                stats.readings_inserted,
                error.as_deref(),
            ) {
                warn!("Could not finish ingest run log: {:#}", e);
            }

            info!(
                "Done: {} days in {:.1?} ({} ingested, {} skipped, {} failed, {} new readings, {} duplicates)",
                stats.days,
                t.elapsed(),
                stats.ingested,
                stats.skipped_empty + stats.skipped_complete,
                stats.failed(),
                stats.readings_inserted,
                stats.duplicates_ignored,
            );
        }

        Command::Audit { from, until, json } => {
            let _t = utils::Timer::start("Audit");
            let range = DateRange::new(
                from.unwrap_or(config.pipeline.audit_start),
                until.unwrap_or(today),
            );
            let repo = open_repo(&config)?;
            let report = Reconciler::new(report_source(&config)?, repo).run(range).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.is_clean() {
                println!("All {} days complete.", report.checked);
            } else {
                println!("{} problem dates:", report.problems.len());
                for p in &report.problems {
                    println!("  {}  expected {:>5}  found {:>5}", p.date, p.expected, p.found);
                }
                if !report.unverified.is_empty() {
                    println!("{} unverified dates:", report.unverified.len());
                    for (date, reason) in &report.unverified {
                        println!("  {}  {}", date, reason);
                    }
                }
            }
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            let stats = repo.stats()?;
            let last_run = repo.last_ingest_run()?;
            println!("─────────────────────────────────");
            println!("  AQI ingest — Database Stats");
            println!("─────────────────────────────────");
            println!("  Readings : {}", utils::fmt_number(stats.readings));
            println!("  Days     : {}", utils::fmt_number(stats.days));
            println!("  From     : {}", stats.first_date.as_deref().unwrap_or("—"));
            println!("  To       : {}", stats.last_date.as_deref().unwrap_or("—"));
            match last_run {
                Some((at, status)) => println!("  Last run : {} ({})", at, status),
                None => println!("  Last run : —"),
            }
            println!("─────────────────────────────────");
        }

        Command::Export { date, out } => {
            let repo = open_repo(&config)?;
            let readings = repo.readings_for_date(&date_key(date))?;
            match out {
                Some(path) => {
                    export::write_csv_file(&readings, &path)?;
                }
                None => {
                    export::write_csv(&readings, std::io::stdout().lock())?;
                }
            }
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}

fn open_repo(config: &AppConfig) -> Result<Arc<Repository>> {
    let repo = Repository::open(&config.storage.db_path)?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(Arc::new(repo))
}

/// HTTP source behind the one process-wide rate gate.
fn report_source(config: &AppConfig) -> Result<Arc<dyn ReportSource>> {
    let gate = Arc::new(RateGate::new(Duration::from_millis(
        config.scraper.effective_delay_ms(),
    )));
    let http = HttpReportSource::new(&config.scraper).context("Failed to build report source")?;
    Ok(Arc::new(RateLimited::new(http, gate)))
}

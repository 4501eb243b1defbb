//! Taxa Ingest - taxonomy harvesting tool

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::Parser;
use taxa_common::logging::{init_logging, LogConfig, LogLevel};
use taxa_ingest::{provider_status, IngestConfig, Ingestor, Provider, RunOptions, RunSummary, StatusReport};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "taxa-ingest")]
#[command(author, version, about = "Taxonomy ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Ingest one provider into its local cache
    Run {
        /// wikidata, iucn, or wikipedia
        provider: Provider,

        /// Only retry entities recorded in the failure ledger
        #[arg(long)]
        failed_only: bool,

        /// Maximum number of entities to process
        #[arg(long)]
        limit: Option<u64>,

        /// Refetch entities even when the cached copy is fresh
        #[arg(long)]
        force: bool,

        /// Start the candidate stream after this position
        #[arg(long, conflicts_with = "reset_cursor")]
        resume_from: Option<i64>,

        /// Start the candidate stream from the beginning
        #[arg(long)]
        reset_cursor: bool,
    },

    /// Show cursor, failure ledger, and cache counts for a provider
    Status {
        provider: Provider,

        /// Number of recent import runs to list
        #[arg(long, default_value_t = 10)]
        recent: u32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("taxa-ingest")
        .build()
        .merge_env();

    let _guard = match log_config.and_then(|config| init_logging(&config)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        },
    };

    if let Err(e) = execute(cli.command).await {
        error!(error = %e, "Run failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn execute(command: Command) -> Result<()> {
    let config = IngestConfig::from_env()?;

    match command {
        Command::Run {
            provider,
            failed_only,
            limit,
            force,
            resume_from,
            reset_cursor,
        } => {
            let mut options = if failed_only {
                RunOptions::failed_only()
            } else {
                RunOptions::full()
            };
            options = options.with_force(force).with_reset_cursor(reset_cursor);
            if let Some(limit) = limit {
                options = options.with_limit(limit);
            }
            if let Some(position) = resume_from {
                options = options.with_resume_from(position);
            }

            let cancel = CancellationToken::new();
            spawn_ctrl_c_handler(cancel.clone());

            let ingestor = Ingestor::open(provider, &config).await?;
            let summary = ingestor.run(&options, &cancel).await?;
            ingestor.store().close().await;

            print_summary(provider, &summary);
        },
        Command::Status { provider, recent } => {
            let report = provider_status(provider, &config, recent).await?;
            print_status(&report);
        },
    }

    Ok(())
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, finishing the current batch without advancing the cursor");
                cancel.cancel();
            },
            Err(e) => warn!(error = %e, "Could not install Ctrl-C handler"),
        }
    });
}

fn format_millis(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn print_summary(provider: Provider, summary: &RunSummary) {
    info!(provider = %provider, "Ingestion complete");
    println!("Provider:   {}", provider);
    println!("Finished:   {}", summary.finished.as_str());
    println!("Processed:  {}", summary.processed);
    println!("  added     {}", summary.added);
    println!("  updated   {}", summary.updated);
    println!("  unchanged {}", summary.unchanged);
    println!("  missing   {}", summary.missing);
    println!("  skipped   {}", summary.skipped);
    println!("  errors    {}", summary.errors);
    if let Some(cursor) = summary.cursor {
        println!("Cursor:     {}", cursor);
    }
}

fn print_status(report: &StatusReport) {
    println!("Provider:   {}", report.provider);
    match report.cursor {
        Some(position) => println!("Cursor:     {} = {}", report.stream, position),
        None => println!("Cursor:     {} (not started)", report.stream),
    }
    println!(
        "Failures:   {} recorded, {} eligible for retry",
        report.failures, report.eligible_failures
    );
    println!("Entities:   {}", report.stats.entities);
    println!("Redirects:  {}", report.stats.redirects);
    println!("Names:      {}", report.stats.names);
    println!(
        "Imports:    {} ({} failed)",
        report.stats.import_runs, report.stats.failed_import_runs
    );
    if let Some(at) = report.stats.last_downloaded_at {
        println!("Last fetch: {}", format_millis(at));
    }

    if !report.recent_runs.is_empty() {
        println!();
        println!("Recent import runs:");
        for run in &report.recent_runs {
            println!(
                "  #{:<8} {:<8} {:>4} {}",
                run.id,
                run.outcome.as_str(),
                run.http_status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                run.target
            );
        }
    }
}

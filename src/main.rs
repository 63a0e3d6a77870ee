//! Sumi-Frontier main entry point
//!
//! This is the command-line interface for the Sumi-Frontier crawl scheduler.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sumi_frontier::config::{load_config_with_hash, Config};
use sumi_frontier::coordination::{SqliteCoordinationStore, StoreOptions};
use sumi_frontier::crawler::{Coordinator, HttpFetcher, Services};
use sumi_frontier::output::{load_statistics, print_report, print_statistics};
use sumi_frontier::storage::{RunStatus, SqliteStorage, Storage};
use tracing_subscriber::EnvFilter;

/// Sumi-Frontier: the scheduling core of a polite web crawler
///
/// Sumi-Frontier fetches pages with a bounded pool of workers, retries
/// transient failures with exponential backoff, dead-letters what cannot be
/// fetched and drains gracefully on Ctrl-C. With a `[coordination]` section
/// several processes share one work queue.
#[derive(Parser, Debug)]
#[command(name = "sumi-frontier")]
#[command(version = "1.0.0")]
#[command(about = "Crawl scheduler with retries, draining and shared queues", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show statistics of the latest run from the database and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,

    /// Extra seed URL, in addition to the configured seeds (repeatable)
    #[arg(long = "seed", value_name = "URL")]
    seeds: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config, &cli.seeds);
        Ok(())
    } else if cli.stats {
        handle_stats(&config)
    } else {
        handle_crawl(&config, &config_hash, cli.seeds).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_frontier=info,warn"),
            1 => EnvFilter::new("sumi_frontier=debug,info"),
            2 => EnvFilter::new("sumi_frontier=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the effective configuration
fn handle_dry_run(config: &Config, extra_seeds: &[String]) {
    let scheduler = &config.scheduler;
    println!("=== Sumi-Frontier Dry Run ===\n");

    println!("Scheduler:");
    println!("  Workers: {}", scheduler.worker_count);
    println!("  Max attempts: {}", scheduler.max_attempts);
    println!(
        "  Backoff: {}ms base, {}ms cap, jitter {}",
        scheduler.base_backoff_ms, scheduler.max_backoff_ms, scheduler.jitter
    );
    println!(
        "  Frontier capacity: {} ({:?}, {:?})",
        scheduler.frontier_capacity, scheduler.backpressure, scheduler.ordering
    );
    println!("  Fetch timeout: {}ms", scheduler.fetch_timeout_ms);
    println!("  Grace period: {}ms", scheduler.grace_period_ms);
    println!("  Max depth: {}", scheduler.max_depth);

    println!("\nUser Agent:");
    println!("  {}", config.user_agent.header_value());

    println!("\nOutput:");
    println!("  Database: {}", config.output.database_path);

    match &config.coordination {
        Some(coordination) => {
            println!("\nCoordination:");
            println!("  Shared database: {}", coordination.database_path);
            println!("  Lease duration: {}ms", coordination.lease_duration_ms);
            println!(
                "  Node: {}",
                coordination.node_id.as_deref().unwrap_or("(generated)")
            );
        }
        None => println!("\nCoordination: local only"),
    }

    if config.scope.allowed_domains.is_empty() {
        println!("\nScope: unrestricted");
    } else {
        println!("\nScope ({}):", config.scope.allowed_domains.len());
        for pattern in &config.scope.allowed_domains {
            println!("  - {}", pattern);
        }
    }

    println!("\nSeeds:");
    for seed in config.seeds.iter().chain(extra_seeds) {
        println!("  * {}", seed);
    }

    println!("\n✓ Configuration is valid");
    println!(
        "✓ Would start crawling with {} seed URLs",
        config.seeds.len() + extra_seeds.len()
    );
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.output.database_path);

    let storage = SqliteStorage::new(Path::new(&config.output.database_path))?;
    match load_statistics(&storage)? {
        Some(stats) => print_statistics(&stats),
        None => println!("No runs recorded yet"),
    }

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(
    config: &Config,
    config_hash: &str,
    extra_seeds: Vec<String>,
) -> anyhow::Result<()> {
    let storage = Arc::new(
        SqliteStorage::new(Path::new(&config.output.database_path))
            .context("Failed to open results database")?,
    );
    let fetcher = Arc::new(HttpFetcher::new(&config.user_agent)?);

    let mut services = Services::new(fetcher, storage.clone(), storage.clone());
    if let Some(coordination) = &config.coordination {
        let options = StoreOptions {
            dedup_ttl: config.scheduler.dedup_ttl(),
            clock_skew_tolerance: coordination.clock_skew_tolerance(),
        };
        let store = SqliteCoordinationStore::open(Path::new(&coordination.database_path), options)
            .context("Failed to open coordination database")?;
        services = services.with_coordination(Arc::new(store));
    }

    let mut coordinator = Coordinator::new(config, services)?;
    coordinator.add_seeds(extra_seeds);

    let run_id = storage.create_run(config_hash, coordinator.node_id())?;
    tracing::info!("Started run {}", run_id);

    let stop = coordinator.stop_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            stop.request_stop();
        }
    });

    match coordinator.run().await {
        Ok(report) => {
            storage.finish_run(run_id, report.status)?;
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            storage.finish_run(run_id, RunStatus::Failed)?;
            Err(e.into())
        }
    }
}

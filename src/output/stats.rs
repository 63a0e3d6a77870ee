//! Statistics and run reports
//!
//! This module provides functionality for extracting crawl statistics from
//! the results database and for printing the report of a finished run.

use crate::crawler::RunReport;
use crate::storage::{DeadLetterRecord, RunRecord, Storage, StorageResult};
use crate::task::DeadLetterReason;
use std::collections::HashMap;

/// Crawl statistics for the most recent run
#[derive(Debug, Clone)]
pub struct CrawlStatistics {
    pub run: RunRecord,

    /// Number of successful results
    pub succeeded: u64,

    /// Failed attempts, including those later retried
    pub failed_attempts: u64,

    /// Count of dead letters by reason
    pub dead_letters_by_reason: HashMap<DeadLetterReason, u64>,

    /// Dead letters with their history, oldest first
    pub dead_letters: Vec<DeadLetterRecord>,
}

impl CrawlStatistics {
    pub fn total_dead_letters(&self) -> u64 {
        self.dead_letters_by_reason.values().sum()
    }

    /// Share of settled tasks that succeeded, as a percentage
    pub fn success_rate(&self) -> f64 {
        let settled = self.succeeded + self.total_dead_letters();
        if settled == 0 {
            return 0.0;
        }
        (self.succeeded as f64 / settled as f64) * 100.0
    }
}

/// Loads statistics for the latest run
///
/// # Arguments
///
/// * `storage` - The storage backend to query
///
/// # Returns
///
/// * `Ok(Some(CrawlStatistics))` - Statistics of the latest run
/// * `Ok(None)` - The database holds no runs yet
/// * `Err(StorageError)` - Failed to query statistics
pub fn load_statistics(storage: &dyn Storage) -> StorageResult<Option<CrawlStatistics>> {
    let Some(run) = storage.get_latest_run()? else {
        return Ok(None);
    };

    let succeeded = storage.count_results(run.id)?;
    let failed_attempts = storage.count_failed_attempts(run.id)?;
    let dead_letters = storage.get_dead_letters(run.id)?;

    let mut dead_letters_by_reason = HashMap::new();
    for record in &dead_letters {
        *dead_letters_by_reason.entry(record.reason).or_insert(0) += 1;
    }

    Ok(Some(CrawlStatistics {
        run,
        succeeded,
        failed_attempts,
        dead_letters_by_reason,
        dead_letters,
    }))
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &CrawlStatistics) {
    println!("=== Crawl Statistics ===\n");

    println!("Run {}:", stats.run.id);
    println!("  Node: {}", stats.run.node_id);
    println!("  Status: {}", stats.run.status.to_db_string());
    println!("  Started: {}", stats.run.started_at);
    if let Some(finished) = &stats.run.finished_at {
        println!("  Finished: {}", finished);
    }
    println!("  Config hash: {}", stats.run.config_hash);
    println!();

    println!("Outcomes:");
    println!("  Succeeded: {}", stats.succeeded);
    println!("  Failed attempts: {}", stats.failed_attempts);
    for reason in [DeadLetterReason::Permanent, DeadLetterReason::PoisonTask] {
        let count = stats.dead_letters_by_reason.get(&reason).unwrap_or(&0);
        println!("  Dead-lettered ({}): {}", reason, count);
    }
    println!();

    if !stats.dead_letters.is_empty() {
        println!("Dead Letters ({}):", stats.dead_letters.len());
        for record in &stats.dead_letters {
            println!(
                "  - {} [{}] after {} attempt(s)",
                record.url, record.reason, record.attempt
            );
            for entry in &record.history {
                println!(
                    "      #{} {} {}: {}",
                    entry.attempt,
                    entry.at.to_rfc3339(),
                    entry.class,
                    entry.cause
                );
            }
        }
        println!();
    }

    println!(
        "Success Rate: {:.1}% ({} / {} settled tasks)",
        stats.success_rate(),
        stats.succeeded,
        stats.succeeded + stats.total_dead_letters()
    );
}

/// Prints the report of a finished run to stdout
pub fn print_report(report: &RunReport) {
    println!("=== Run Report ===\n");
    println!("  Node: {}", report.node_id);
    println!("  Outcome: {}", report.status.to_db_string());
    println!("  Elapsed: {:.1}s", report.elapsed.as_secs_f64());
    println!("  Seeds accepted: {}", report.seeds.accepted);
    println!("  Seeds duplicate: {}", report.seeds.duplicates);
    println!("  Seeds rejected: {}", report.seeds.rejected);
    println!("  Succeeded: {}", report.stats.succeeded);
    println!("  Retried: {}", report.stats.retried);
    println!("  Dead-lettered: {}", report.stats.dead_lettered);
    println!("  Abandoned: {}", report.abandoned.len());
    println!("  Links discovered: {}", report.stats.discovered);
    println!("  Duplicate links: {}", report.stats.duplicates);
    println!("  Out of scope: {}", report.stats.out_of_scope);
    println!("  Rejected discoveries: {}", report.stats.rejected_discoveries);
    println!("  Stale leases: {}", report.stats.stale_leases);
    println!("  Sink errors: {}", report.stats.sink_errors);
    println!("  Peak in flight: {}", report.peak_in_flight);

    if !report.abandoned.is_empty() {
        println!("\nAbandoned tasks:");
        for abandoned in &report.abandoned {
            println!("  - {} (attempt {})", abandoned.task.url, abandoned.task.attempt);
        }
    }
}

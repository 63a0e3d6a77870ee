//! Output module: where the worker pool's results go
//!
//! This module handles:
//! - The sink traits the pool writes results and dead letters to
//! - An in-memory sink for embedding and tests
//! - Statistics and run reports for the command line

mod memory;
pub mod stats;
mod traits;

pub use memory::MemorySink;
pub use stats::{load_statistics, print_report, print_statistics, CrawlStatistics};
pub use traits::{DeadLetterSink, ResultSink, SinkError, SinkResult};

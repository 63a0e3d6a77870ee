//! URL handling module for Sumi-Frontier
//!
//! This module provides canonicalization (the identity used for
//! deduplication) and crawl scope filtering.

mod normalize;
mod scope;

pub use normalize::canonicalize;
pub use scope::Scope;

//! Link extraction collaborator
//!
//! Extraction rules for [`HtmlLinkExtractor`]:
//!
//! **Include:**
//! - `<a href="...">` anywhere in the document
//! - `<link rel="canonical" href="...">`
//!
//! **Exclude:**
//! - `<a href="..." download>`
//! - `javascript:`, `mailto:`, `tel:` and `data:` links
//! - Same-page fragment links
//! - Anything that does not resolve to HTTP(S)
//!
//! `rel="nofollow"` links are followed.

use crate::crawler::fetcher::FetchResponse;
use crate::task::Task;
use scraper::{Html, Selector};
use url::Url;

/// Turns a fetched document into candidate link targets
///
/// Returned strings are absolute but not yet canonical; the worker pool
/// canonicalizes and deduplicates them.
pub trait LinkExtractor: Send + Sync {
    fn extract(&self, task: &Task, response: &FetchResponse) -> Vec<String>;
}

/// HTML implementation of [`LinkExtractor`] backed by scraper
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlLinkExtractor;

impl LinkExtractor for HtmlLinkExtractor {
    fn extract(&self, _task: &Task, response: &FetchResponse) -> Vec<String> {
        extract_links(&response.body, &response.final_url)
    }
}

/// Extracts absolute link targets from an HTML document
///
/// # Arguments
///
/// * `html` - The HTML content
/// * `base_url` - The base URL for resolving relative links
///
/// # Example
///
/// ```
/// use sumi_frontier::crawler::extract_links;
/// use url::Url;
///
/// let html = r#"<html><body><a href="/page">Link</a></body></html>"#;
/// let base_url = Url::parse("https://example.com/").unwrap();
/// assert_eq!(extract_links(html, &base_url), ["https://example.com/page"]);
/// ```
pub fn extract_links(html: &str, base_url: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut links = Vec::new();

    if let Ok(anchors) = Selector::parse("a[href]") {
        links.extend(
            document
                .select(&anchors)
                .filter(|el| el.value().attr("download").is_none())
                .filter_map(|el| el.value().attr("href"))
                .filter_map(|href| resolve_link(href, base_url)),
        );
    }

    if let Ok(canonical) = Selector::parse("link[rel='canonical'][href]") {
        links.extend(
            document
                .select(&canonical)
                .filter_map(|el| el.value().attr("href"))
                .filter_map(|href| resolve_link(href, base_url)),
        );
    }

    links
}

/// Resolves an href against the base URL, or None if it should be skipped
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    const SKIPPED_SCHEMES: [&str; 4] = ["javascript:", "mailto:", "tel:", "data:"];
    let lowered = href.to_ascii_lowercase();
    if SKIPPED_SCHEMES.iter().any(|s| lowered.starts_with(s)) {
        return None;
    }

    let absolute = base_url.join(href).ok()?;
    matches!(absolute.scheme(), "http" | "https").then(|| absolute.to_string())
}

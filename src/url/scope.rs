//! Crawl scope: which hosts discovered links may point at

use url::Url;

/// A set of host patterns that discovered links must match to be followed
///
/// Patterns are either exact hosts (`example.com`) or wildcard patterns
/// (`*.example.com`), which match the bare host and every subdomain below
/// it. An empty scope allows every host.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    patterns: Vec<String>,
}

impl Scope {
    /// Creates a scope from configured patterns; matching is case-insensitive
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_ascii_lowercase()).collect(),
        }
    }

    /// Returns true if no restriction is configured
    pub fn is_unrestricted(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns true if the URL's host falls inside this scope
    pub fn allows(&self, url: &Url) -> bool {
        if self.is_unrestricted() {
            return true;
        }

        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        self.patterns.iter().any(|p| host_matches(p, &host))
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(base) => {
            host == base
                || host
                    .strip_suffix(base)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        }
        None => host == pattern,
    }
}

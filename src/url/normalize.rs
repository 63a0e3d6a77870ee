use crate::UrlError;
use url::Url;

/// Canonicalizes a target URL into the form used for deduplication
///
/// # Canonicalization Steps
///
/// 1. Parse the URL; reject if malformed
/// 2. Reject anything that is not HTTP or HTTPS
/// 3. Lowercase the scheme and host
/// 4. Strip the port when it is the scheme's default (`:80`, `:443`)
/// 5. Resolve dot segments; an empty path becomes `/`
/// 6. Remove the fragment (everything after #)
/// 7. Sort query parameters by key, then by value
/// 8. Remove an empty query string (trailing ?)
///
/// Steps 3 to 5 are performed by the WHATWG parser in the `url` crate for
/// special schemes; they are listed here because the dedup contract relies
/// on them.
///
/// # Arguments
///
/// * `url_str` - The URL string to canonicalize
///
/// # Returns
///
/// * `Ok(Url)` - Canonical URL
/// * `Err(UrlError)` - Failed to parse or the URL is not crawlable
///
/// # Examples
///
/// ```
/// use sumi_frontier::url::canonicalize;
///
/// let url = canonicalize("HTTP://Example.COM:80/a/../b?z=1&a=2#top").unwrap();
/// assert_eq!(url.as_str(), "http://example.com/b?a=2&z=1");
/// ```
pub fn canonicalize(url_str: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(format!(
            "Only HTTP and HTTPS schemes are supported, got: {}",
            url.scheme()
        )));
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => return Err(UrlError::MissingDomain),
    }

    url.set_fragment(None);

    if url.query().is_some() {
        let params = sorted_query_params(&url);

        if params.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(params);
        }
    }

    Ok(url)
}

/// Collects query parameters, sorted by key and then value
fn sorted_query_params(url: &Url) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    params.sort();
    params
}

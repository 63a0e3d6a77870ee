//! Fetching collaborator
//!
//! The scheduler only needs something that turns a [`Task`] into either a
//! response or a classified error. [`HttpFetcher`] is the reqwest-backed
//! implementation the binary uses; tests substitute scripted fetchers.

use crate::config::UserAgentConfig;
use crate::task::{ErrorClass, Task};
use async_trait::async_trait;
use reqwest::{redirect::Policy, Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Maximum redirect hops followed for a single fetch
const MAX_REDIRECTS: usize = 10;

/// A successfully fetched document
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Final URL after redirects
    pub final_url: Url,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub body: String,
}

/// Why a fetch failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Unsupported content type: {0}")]
    UnsupportedContent(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Classifies the error for the retry policy
    ///
    /// | Error | Class |
    /// |-------|-------|
    /// | Timeout, connection failure, other network error | Transient |
    /// | HTTP 429, HTTP 5xx | Transient |
    /// | Any other HTTP status | Permanent |
    /// | Unsupported or malformed response | Permanent |
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout | Self::Connect(_) | Self::Network(_) => ErrorClass::Transient,
            Self::Status(code) => {
                if *code == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..600).contains(code) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            Self::UnsupportedContent(_) | Self::Malformed(_) => ErrorClass::Permanent,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_redirect() {
            Self::Malformed(format!("redirect error: {}", e))
        } else if e.is_builder() {
            Self::Malformed(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Fetches the document behind a task
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Performs a single attempt; `timeout` bounds the whole request
    async fn fetch(&self, task: &Task, timeout: Duration) -> Result<FetchResponse, FetchError>;
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The user agent configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
///
/// # Example
///
/// ```no_run
/// use sumi_frontier::config::UserAgentConfig;
/// use sumi_frontier::crawler::build_http_client;
///
/// let config = UserAgentConfig {
///     crawler_name: "SumiFrontier".to_string(),
///     crawler_version: "1.0".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "admin@example.com".to_string(),
/// };
///
/// let client = build_http_client(&config).unwrap();
/// ```
pub fn build_http_client(config: &UserAgentConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.header_value())
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .brotli(true)
        .build()
}

/// HTTP implementation of [`Fetcher`] backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &UserAgentConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    /// GETs the task URL and returns HTML bodies
    ///
    /// Non-2xx statuses become [`FetchError::Status`]; a 2xx response that
    /// is not `text/html` becomes [`FetchError::UnsupportedContent`].
    async fn fetch(&self, task: &Task, timeout: Duration) -> Result<FetchResponse, FetchError> {
        let response = self
            .client
            .get(task.url.clone())
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match content_type.as_deref() {
            Some(ct) if ct.contains("text/html") => {}
            other => {
                return Err(FetchError::UnsupportedContent(
                    other.unwrap_or("<none>").to_string(),
                ))
            }
        }

        let body = response.text().await?;

        Ok(FetchResponse {
            final_url,
            status_code: status.as_u16(),
            content_type,
            body,
        })
    }
}

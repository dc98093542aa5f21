//! Source adapters: fetch one upstream snapshot and normalise it to records.
//!
//! An adapter owns URL construction, query encoding, response decoding and
//! projection to `Record`s. It never touches persisted state; its only side
//! effect is logging. Rows with unusable numerics are dropped and counted,
//! never escalated to a tick failure.

mod http_html;
mod http_json;

use async_trait::async_trait;

use crate::error::{AppError, Result, SourceError};
use crate::models::{Record, SourceSpec};
use crate::utils::Shutdown;
use crate::utils::http::HttpClient;
use crate::utils::retry::{RetryPolicy, retry_with_policy};

pub use http_html::HttpHtmlSource;
pub use http_json::HttpJsonSource;

/// Result of one fetch: normalised records plus drop accounting.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub records: Vec<Record>,
    pub stats: FetchStats,
}

/// Row accounting for one fetch.
#[derive(Debug, Default, Clone, Copy)]
pub struct FetchStats {
    /// Rows present in the decoded response
    pub rows_seen: usize,
    /// Rows dropped for missing identity or unusable numerics
    pub rows_dropped: usize,
}

/// One upstream HTTP endpoint normalised to typed records.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Adapter kind, for logs.
    fn kind(&self) -> &'static str;

    /// Perform exactly one outbound request and project the response.
    async fn fetch(&self, http: &HttpClient) -> std::result::Result<FetchOutcome, SourceError>;
}

/// Build the adapter for a source spec, validating URLs and selectors so
/// that misconfiguration surfaces at startup rather than on the first tick.
pub fn build_adapter(
    spec: &SourceSpec,
    rate_limit_per_minute: Option<u32>,
) -> Result<Box<dyn SourceAdapter>> {
    match spec {
        SourceSpec::HttpJson {
            url,
            query,
            path_to_rows,
            field_map,
        } => Ok(Box::new(HttpJsonSource::new(
            url,
            query,
            path_to_rows,
            field_map.clone(),
            rate_limit_per_minute,
        )?)),
        SourceSpec::HttpHtml {
            url,
            row_selector,
            field_selectors,
        } => Ok(Box::new(HttpHtmlSource::new(
            url,
            row_selector,
            field_selectors.clone(),
            rate_limit_per_minute,
        )?)),
    }
}

/// Fetch with the bounded source retry policy. Only `Transport` and 5xx
/// statuses are retried; decode and schema failures are final.
pub async fn fetch_with_retry(
    adapter: &dyn SourceAdapter,
    http: &HttpClient,
    shutdown: &Shutdown,
) -> std::result::Result<FetchOutcome, SourceError> {
    let policy = RetryPolicy::source();
    retry_with_policy(&policy, shutdown, || adapter.fetch(http)).await
}

/// GET a URL and classify transport/status failures as source errors.
pub(crate) async fn get_checked(
    http: &HttpClient,
    url: &url::Url,
    rate_per_minute: Option<u32>,
) -> std::result::Result<String, SourceError> {
    let (status, body) = http
        .get(url, rate_per_minute)
        .await
        .map_err(SourceError::Transport)?;

    if !(200..300).contains(&status) {
        return Err(SourceError::HttpStatus { code: status });
    }
    Ok(body)
}

/// Render a configuration-level adapter error.
pub(crate) fn config_error(message: impl Into<String>) -> AppError {
    AppError::config(message)
}

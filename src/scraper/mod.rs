pub mod http_client;
pub mod parsers;
pub mod rate_limit;

use async_trait::async_trait;
use thiserror::Error;

pub use self::http_client::HttpReportSource;

// ── Fetch boundary ────────────────────────────────────────────────────────────

/// Raw response for one (date, page) request.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub status: u16,
    pub body: String,
}

/// Transport failures, categorised. Nothing past the fetch boundary sees a
/// `reqwest::Error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("too many redirects: {0}")]
    TooManyRedirects(String),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("request failed: {0}")]
    Other(String),
}

/// Swappable report source: fetch page `page` (1-based) of the report for `date`.
///
/// Implementations must not retry; callers decide what a failure means.
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn fetch(&self, date: &str, page: u32) -> Result<RawPage, FetchError>;
}

//! Error taxonomy for the crawl pipeline.
//!
//! Transport failures, protocol failures, and detection events are kept
//! distinct: a `Detection` is not a network problem and must never be
//! retried with the same profile, while `RateLimitExceeded` and
//! `CircuitOpen` are local gates raised before any network attempt.

use std::time::Duration;

/// All errors that can surface from a crawl.
#[derive(thiserror::Error, Debug)]
pub enum CrawlError {
    /// Connection-level failure (DNS, TCP, TLS, reset mid-body).
    #[error("network error: {0}")]
    Network(String),

    /// Connect or total timeout elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The response arrived but could not be interpreted.
    #[error("malformed response: {0}")]
    Protocol(String),

    /// Bot protection fired. Not a transport failure.
    #[error("bot protection triggered: {system} (confidence {confidence:.2})")]
    Detection { system: String, confidence: f64 },

    /// The server answered with a non-retryable HTTP status.
    #[error("http status {0}")]
    Status(u16),

    /// Local rate-limit gate; no network attempt was made.
    #[error("rate limit exceeded for {domain}, next slot in {wait:?}")]
    RateLimitExceeded { domain: String, wait: Duration },

    /// Circuit breaker fast-fail; no network attempt was made.
    #[error("circuit open for {domain}, retry after {retry_after:?}")]
    CircuitOpen {
        domain: String,
        retry_after: Duration,
    },

    /// No non-banned, non-checked-out identity is available.
    #[error("profile pool exhausted")]
    ProfileExhausted,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Profile persistence failed.
    #[error("profile store: {0}")]
    Store(String),

    /// No render engine is attached to this crawler.
    #[error("render engine unavailable: {0}")]
    RenderUnavailable(String),

    /// The batch deadline expired before this item finished.
    #[error("cancelled by batch deadline")]
    Cancelled,
}

impl CrawlError {
    /// Whether the retry policy may re-attempt with backoff.
    ///
    /// Network errors, timeouts, 5xx, and 429 qualify. Everything else is
    /// surfaced to the caller (or handled by profile rotation).
    pub fn is_retryable(&self) -> bool {
        match self {
            CrawlError::Network(_) | CrawlError::Timeout(_) => true,
            CrawlError::Status(code) => *code == 429 || *code >= 500,
            _ => false,
        }
    }

    /// Whether this outcome burns the profile that produced it: the next
    /// attempt must run under a rotated or fresh identity.
    pub fn is_profile_burning(&self) -> bool {
        match self {
            CrawlError::Detection { .. } => true,
            CrawlError::Status(code) => (400..500).contains(code) && *code != 429,
            _ => false,
        }
    }
}

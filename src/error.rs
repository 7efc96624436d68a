use std::time::Duration;

use thiserror::Error;

use crate::providers::HTTP_TIMEOUT;

/// Failure of a single provider call. Always attached to that provider's
/// report, never propagated out of a discovery.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: no admission token available")]
    RateLimited,
    #[error("circuit breaker open")]
    CircuitOpen,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("missing API key: {0}")]
    MissingKey(String),
}

impl ProviderError {
    /// Classify an HTTP failure from a client configured with `timeout`.
    pub fn from_http(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(timeout)
        } else if e.is_decode() || e.is_body() {
            ProviderError::Parse(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::from_http(e, HTTP_TIMEOUT)
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Parse(e.to_string())
    }
}

/// Cache tier failures. Callers treat reads as misses and drop writes.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache read failed for '{key}': {message}")]
    Read { key: String, message: String },
    #[error("cache write failed for '{key}': {message}")]
    Write { key: String, message: String },
    #[error("cache payload (de)serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Hard failures of `DiscoveryEngine::discover`. Provider failures never end up here.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

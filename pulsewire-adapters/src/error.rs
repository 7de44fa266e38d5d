//! Error types for producers.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while refreshing a producer.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// HTTP request failed or returned an unexpected status.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Failed to parse a response or file.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Credentials were rejected.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Connection failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Timeout waiting for response.
    #[error("Request timed out")]
    Timeout,

    /// The upstream asked us to back off.
    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Local file access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The producer has no credentials or source configured.
    #[error("Producer not configured")]
    NotConfigured,
}

#[cfg(any(feature = "github", feature = "spotify"))]
impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout
        } else if err.is_connect() {
            AdapterError::Connection(err.to_string())
        } else if err.is_decode() {
            AdapterError::Parse(err.to_string())
        } else {
            AdapterError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::Parse(err.to_string())
    }
}

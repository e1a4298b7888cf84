//! Error types
//!
//! Structured error handling shared by the remote backends and the cache.
//! Maps HTTP status codes to specific error variants for propagation and
//! degrade decisions.

use std::path::PathBuf;

/// Errors surfaced by remote sources and the local cache
#[derive(Debug, thiserror::Error)]
pub enum RemoteDataError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limited by the remote backend")]
    RateLimited,

    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Content mismatch for {path}: expected {expected}, got {actual}")]
    ContentMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Storage failure at {path:?}: {source}")]
    StorageFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, RemoteDataError>;

impl RemoteDataError {
    /// Whether a failed revision check may degrade to a stale cache hit
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteDataError::RateLimited | RemoteDataError::Unavailable(_)
        )
    }

    /// Create an error from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => RemoteDataError::Unauthorized(body.to_string()),
            404 => RemoteDataError::NotFound(body.to_string()),
            408 => RemoteDataError::Unavailable("request timeout".to_string()),
            429 => RemoteDataError::RateLimited,
            500..=599 => RemoteDataError::Unavailable(format!("server error {status}: {body}")),
            _ => RemoteDataError::Unavailable(format!("unexpected HTTP {status}: {body}")),
        }
    }

    /// Map a transport-level failure from the HTTP client
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteDataError::Unavailable("request timed out".to_string())
        } else {
            RemoteDataError::Unavailable(err.to_string())
        }
    }
}

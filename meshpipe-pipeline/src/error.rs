//! Error types for the processing pipeline

use std::time::Duration;
use thiserror::Error;

/// Failure to download a remote asset
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error(
        "access forbidden (403) for {url}: the download link has most likely expired. \
         Generate a fresh link or download the file and pass its local path instead"
    )]
    AuthExpired { url: String },

    #[error("file not found (404) for {url}: the resource may have been moved or deleted")]
    NotFound { url: String },

    #[error("service temporarily unavailable ({status}) for {url}")]
    RateLimited { url: String, status: u16 },

    #[error("download timed out for {url}")]
    Timeout { url: String },

    #[error(
        "could not connect to {url}: {message}. Check the network connection, or download \
         the file manually and pass its local path instead"
    )]
    Connection { url: String, message: String },

    #[error("HTTP error {status} for {url}")]
    Http { url: String, status: u16 },

    #[error("invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

impl FetchError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. } | FetchError::Timeout { .. } | FetchError::Connection { .. }
        )
    }

    /// Backoff multiplier applied before the next attempt, if any is made
    pub fn backoff_factor(&self) -> Option<f64> {
        match self {
            FetchError::RateLimited { .. } => Some(2.0),
            FetchError::AuthExpired { .. }
            | FetchError::Timeout { .. }
            | FetchError::Connection { .. } => Some(1.5),
            _ => None,
        }
    }
}

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("Download failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("{operation} timed out after {}s", .timeout.as_secs())]
    ConversionTimeout { operation: String, timeout: Duration },

    #[error("{operation} failed: {reason}")]
    ConversionFailed { operation: String, reason: String },

    #[error("Decimation failed: {0}")]
    Decimation(String),

    #[error("Mesh repair failed: {0}")]
    Repair(String),

    #[error("Remeshing failed: {0}")]
    Remesh(String),

    #[error("Archive creation failed: {0}")]
    Archive(String),

    #[error("Cannot resolve input {input}: {message}")]
    InputResolution { input: String, message: String },

    #[error("No valid output model could be produced: {0}")]
    Exhausted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Automation host unavailable: {0}")]
    HostUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mesh error: {0}")]
    Mesh(#[from] meshpipe_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn input(input: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::InputResolution {
            input: input.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

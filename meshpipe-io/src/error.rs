//! Error types for I/O operations

use thiserror::Error;

/// Errors that can occur during I/O operations
#[derive(Error, Debug)]
pub enum IoError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid file format: {format}")]
    InvalidFormat { format: String },

    #[error("Malformed {format}: {message}")]
    Malformed { format: &'static str, message: String },

    #[error("Write error: {message}")]
    WriteError { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<IoError> for meshpipe_core::Error {
    fn from(err: IoError) -> Self {
        match err {
            IoError::Io(e) => meshpipe_core::Error::Io(e),
            IoError::InvalidFormat { format } => meshpipe_core::Error::UnsupportedFormat(format),
            other => meshpipe_core::Error::InvalidData(other.to_string()),
        }
    }
}

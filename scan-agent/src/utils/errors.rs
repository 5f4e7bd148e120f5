//! Error types for the scan agent.

use thiserror::Error;

/// Failure classes a scan run can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad user input, detected before any network activity
    FatalInput,
    /// The service answered with an error or without a required field
    RemoteRejection,
    /// Network failure or timeout on a single call
    TransportFailure,
    /// Local disk/permission failure while packaging
    ResourceFailure,
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid API key: {0}")]
    InvalidApiKey(String),

    #[error("Invalid directory: {0}")]
    InvalidDirectory(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Service rejected the request: {0}")]
    RemoteRejection(String),

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Packaging failed: {0}")]
    Packaging(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Upload acknowledgment failed: {0}")]
    AckFailed(String),

    #[error("Polling failed: {0}")]
    Poll(String),
}

impl ScanError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ScanError::InvalidApiKey(_) | ScanError::InvalidDirectory(_) | ScanError::Config(_) => {
                ErrorCategory::FatalInput
            }
            ScanError::RemoteRejection(_) | ScanError::AckFailed(_) | ScanError::Serialization(_) => {
                ErrorCategory::RemoteRejection
            }
            ScanError::Http(_) | ScanError::Transport(_) | ScanError::Upload(_) | ScanError::Poll(_) => {
                ErrorCategory::TransportFailure
            }
            ScanError::Io(_) | ScanError::Packaging(_) | ScanError::Task(_) => {
                ErrorCategory::ResourceFailure
            }
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::FatalInput => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

//! Error types for the conformance service

use thiserror::Error;

/// Result type alias for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Main error type for the conformance service
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Server task failed to complete
    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

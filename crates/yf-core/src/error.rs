//! Error types for yieldfit

use thiserror::Error;

/// yieldfit error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Fatal configuration problem (bad binning, unknown mode, zero normalization sum, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed input arrays or arguments
    #[error("Validation error: {0}")]
    Validation(String),

    /// Numerical failure (singular system, optimizer breakdown)
    #[error("Computation error: {0}")]
    Computation(String),

    /// Event source could not serve a tree, branch or counter
    #[error("Data source error: {0}")]
    DataSource(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for Trueno-AB
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)
//!
//! The first five variants are the engine's error taxonomy. Ingestion and
//! assignment paths return them to the caller; analysis and decision paths
//! catch them per experiment so one malformed experiment never halts the
//! evaluation of others.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Trueno-AB error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request, rejected at the boundary
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unknown experiment or variant
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid experiment setup (blocks activation, never silently defaults)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Concurrent lifecycle mutation lost the version race
    #[error("Conflict: {0}\nReload the experiment and retry the mutation.")]
    Conflict(String),

    /// Numerical failure in a statistical routine (degenerate input)
    #[error("Computation error: {0}")]
    Computation(String),

    /// Analysis run exceeded its time budget
    #[error("Analysis timed out after {0} ms; experiment left unchanged")]
    Timeout(u64),

    /// Storage error (Parquet/Arrow checkpoint)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Notification or implementation queue closed
    #[error("Queue closed (receiver dropped)")]
    QueueClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// HTTP-style status code for the external endpoints.
    ///
    /// Client faults map to 4xx, everything else is a server-side 5xx.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) | Self::Serialization(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Configuration(_) => 422,
            Self::Timeout(_) => 504,
            Self::Computation(_)
            | Self::StorageError(_)
            | Self::QueueClosed
            | Self::Io(_)
            | Self::Arrow(_)
            | Self::Parquet(_) => 500,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Timeout(_) | Self::QueueClosed)
    }
}

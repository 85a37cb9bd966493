//! Common error types for the writer
//!
//! # Design Principles (KISS)
//! - One top-level error for everything surfaced to callers
//! - Each module keeps its own narrow error and converts into `WriterError`
//! - Use thiserror for ergonomic error handling

use thiserror::Error;

use crate::common::record::EncodingError;
use crate::config::ConfigError;
use crate::recorder::FileFormatError;
use crate::rolling::RollingError;

/// Errors raised by the writer
///
/// Only configuration errors reach producers synchronously. Everything the
/// consumer thread hits at runtime is routed to the fault policy instead.
#[derive(Error, Debug)]
pub enum WriterError {
    /// A caller-supplied value is unusable (path, schema)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Tuning values are inconsistent (capacity, rolling policy)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Writer is not accepting records (startup fault or shutdown)
    #[error("Writer is closed")]
    Closed,

    /// Timeout waiting for operation
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Container file format error
    #[error("File format error: {0}")]
    Format(#[from] FileFormatError),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl WriterError {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// True for errors raised while validating construction input
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::InvalidConfiguration(_) | Self::Config(_)
        )
    }
}

impl From<RollingError> for WriterError {
    fn from(err: RollingError) -> Self {
        match err {
            RollingError::NoThreshold => Self::InvalidConfiguration(err.to_string()),
            _ => Self::IllegalState(err.to_string()),
        }
    }
}

/// Result type alias using WriterError
pub type WriterResult<T> = Result<T, WriterError>;

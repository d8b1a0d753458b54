//! Error types for the Stash engine.

use thiserror::Error;

/// All possible errors from the Stash engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Value errors
    #[error("type error: {0}")]
    TypeError(String),

    #[error("invalid class name: {0:?}")]
    InvalidClassName(String),

    // Query errors
    #[error("invalid constraint: {0}")]
    ConstraintError(String),

    // Encoding errors
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
}

impl Error {
    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Error::TypeError(message.into())
    }

    pub(crate) fn constraint(message: impl Into<String>) -> Self {
        Error::ConstraintError(message.into())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

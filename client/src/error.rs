//! Unified error handling for the client.

/// Client error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    /// No network or remote unreachable; retried by the outbox
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Validation, permission or conflict rejection; never retried
    #[error("Server rejected: {0}")]
    ServerRejected(String),

    #[error("Invalid query: {0}")]
    Constraint(String),

    /// Local storage medium failure
    #[error("IO error: {0}")]
    Io(String),

    /// Illegal operation ordering
    #[error("Invalid state: {0}")]
    State(String),

    #[error("Type error: {0}")]
    Type(String),
}

impl Error {
    /// Whether the operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connectivity(_))
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Error::State(message.into())
    }
}

impl From<stash_engine::Error> for Error {
    fn from(err: stash_engine::Error) -> Self {
        use stash_engine::Error as Engine;
        match err {
            Engine::TypeError(msg) => Error::Type(msg),
            Engine::InvalidClassName(name) => Error::Type(format!("invalid class name: {name:?}")),
            Engine::ConstraintError(msg) => Error::Constraint(msg),
            Engine::InvalidEncoding(msg) => Error::Io(msg),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Storage error: {:?}", err);
        Error::Io(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Io(format!("migration failed: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Io(format!("corrupt record: {err}"))
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_client_kinds() {
        let err: Error = stash_engine::Error::ConstraintError("bad or".into()).into();
        assert_eq!(err, Error::Constraint("bad or".into()));

        let err: Error = stash_engine::Error::TypeError("not a number".into()).into();
        assert!(matches!(err, Error::Type(_)));
    }

    #[test]
    fn only_connectivity_is_retryable() {
        assert!(Error::Connectivity("offline".into()).is_retryable());
        assert!(!Error::ServerRejected("invalid".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
    }
}

//! Error types for crm-sync-engine.

use serde::Serialize;
use std::fmt;
use sync_client::RemoteError;
use sync_core::{QueueError, ResolutionError};
use sync_types::{LogError, ValueError};

/// Main error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An entity, log, conflict or remote record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up.
        kind: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// A request was malformed or not allowed in the current state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Conflict resolution was rejected.
    #[error("resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    /// The remote CRM call failed (after retries, if retryable).
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Record store error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Job queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Attempt log lifecycle error.
    #[error("sync log error: {0}")]
    Log(#[from] LogError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Error taxonomy used for reporting and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Entity, conflict or remote record missing. Not retried.
    NotFound,
    /// Malformed request. Not retried.
    Validation,
    /// Concurrent divergent edit, or a conflict already settled.
    Conflict,
    /// Rate limit, 5xx or network failure.
    Transient,
    /// 4xx (other than rate limit) from the remote.
    Permanent,
    /// A worker stopped reporting progress.
    Stall,
    /// Storage, queue bookkeeping or configuration failure.
    Internal,
}

impl ErrorKind {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Stall => "stall",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EngineError {
    /// Shorthand for [`EngineError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Resolution(ResolutionError::AlreadyResolved(_)) => ErrorKind::Conflict,
            Self::Resolution(_) => ErrorKind::Validation,
            Self::Remote(RemoteError::NotFound(_)) => ErrorKind::NotFound,
            Self::Remote(e) if e.is_retryable() => ErrorKind::Transient,
            Self::Remote(_) => ErrorKind::Permanent,
            Self::Queue(QueueError::DuplicateJob(_)) => ErrorKind::Validation,
            Self::Log(LogError::NotRetryable { .. }) => ErrorKind::Validation,
            Self::Store(_) | Self::Queue(_) | Self::Log(_) | Self::Config(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<ValueError> for EngineError {
    fn from(err: ValueError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type alias for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use sync_client::NetworkErrorKind;
    use sync_types::ConflictId;

    #[test]
    fn remote_errors_split_into_transient_and_permanent() {
        let transient = EngineError::from(RemoteError::Network {
            kind: NetworkErrorKind::TimedOut,
            message: "timed out".into(),
        });
        assert_eq!(transient.kind(), ErrorKind::Transient);
        assert_eq!(EngineError::from(RemoteError::rate_limited()).kind(), ErrorKind::Transient);

        let permanent = EngineError::from(RemoteError::Status {
            code: 422,
            message: "bad email".into(),
        });
        assert_eq!(permanent.kind(), ErrorKind::Permanent);

        let missing = EngineError::from(RemoteError::NotFound("42".into()));
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn resolution_errors_are_caller_errors() {
        let again = EngineError::from(ResolutionError::AlreadyResolved(ConflictId::new()));
        assert_eq!(again.kind(), ErrorKind::Conflict);

        let missing = EngineError::from(ResolutionError::MissingFieldChoices {
            missing: vec!["email".into()],
        });
        assert_eq!(missing.kind(), ErrorKind::Validation);
        assert!(missing.to_string().contains("email"));
    }

    #[test]
    fn not_found_display() {
        let err = EngineError::not_found("conflict", "abc");
        assert_eq!(err.to_string(), "conflict not found: abc");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn storage_errors_are_internal() {
        let err = EngineError::from(StoreError::Migration("no table".into()));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineError>();
        assert_send_sync::<StoreError>();
    }
}

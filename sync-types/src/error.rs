//! Error types for crm-sync data model operations.

use thiserror::Error;

/// Errors raised when validating or applying field values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    /// Input was expected to be a JSON object.
    #[error("expected an object of fields")]
    NotAnObject,

    /// A value is not an allowed scalar.
    #[error("invalid value for field {field}: {reason}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The field does not exist on this entity type.
    #[error("unknown field for {entity_type}: {field}")]
    UnknownField {
        /// Entity type name.
        entity_type: &'static str,
        /// Field name.
        field: String,
    },

    /// The field exists but the value has the wrong type.
    #[error("field {field} expects {expected}, got {actual}")]
    TypeMismatch {
        /// Field name.
        field: String,
        /// Expected type.
        expected: &'static str,
        /// Actual type.
        actual: &'static str,
    },
}

/// Errors raised by attempt log lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    /// The log was already finalized as success or failed.
    #[error("sync log {0} is already finalized")]
    AlreadyFinalized(String),

    /// Only failed logs can be queued for retry.
    #[error("only failed syncs can be retried (log {id} is {status})")]
    NotRetryable {
        /// Log id.
        id: String,
        /// Current status.
        status: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ValueError::TypeMismatch {
            field: "email".into(),
            expected: "string",
            actual: "number",
        };
        assert_eq!(err.to_string(), "field email expects string, got number");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ValueError>();
        assert_send_sync::<LogError>();
    }
}

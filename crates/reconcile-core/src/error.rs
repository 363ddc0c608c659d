//! Error types for the reconciliation engine.
//!
//! Every store adapter and engine operation returns [`ReconcileError`]. The
//! engine only cares about one property of an error: whether retrying the
//! same call can plausibly succeed. See [`ReconcileError::is_transient`].

use std::time::Duration;
use thiserror::Error;

/// Main error type for the reconciliation engine.
#[derive(Debug, Error)]
pub enum ReconcileError {
    // Transient backend errors
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Rate limited by store, retry after {retry_after_ms:?} ms")]
    RateLimited { retry_after_ms: Option<u64> },

    // Backend errors whose class depends on the message
    #[error("Store error during {operation}: {message}")]
    Store { operation: String, message: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Record-level errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    // Run-level errors
    #[error("Cannot {command} while the run is {phase}")]
    InvalidCommand { command: String, phase: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Run paused")]
    Paused,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Retry classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying the same call may succeed.
    Transient,
    /// Retrying will not help.
    Permanent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Lower-case fragments that mark a free-form backend message as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection",
    "unavailable",
    "deadline",
    "reset",
    "refused",
    "try again",
    "temporarily",
];

/// Check whether a free-form error message carries a transient indicator.
pub fn message_looks_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for ReconcileError {
    fn from(err: rusqlite::Error) -> Self {
        ReconcileError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ReconcileError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        ReconcileError::Network {
            message: message.into(),
        }
    }

    /// Create a store error for a named operation.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Check if retrying the failed call may succeed.
    ///
    /// Typed transient variants always qualify. Generic store, database and
    /// free-form errors qualify when their message mentions a network,
    /// timeout, connection or availability problem. SQLite busy/locked
    /// conditions are also transient.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Network { .. }
            | ReconcileError::Timeout(_)
            | ReconcileError::Unavailable { .. }
            | ReconcileError::RateLimited { .. } => true,
            ReconcileError::Store { message, .. } | ReconcileError::Other(message) => {
                message_looks_transient(message)
            }
            ReconcileError::Database { message, source } => {
                let busy = matches!(
                    source,
                    Some(rusqlite::Error::SqliteFailure(e, _))
                        if matches!(
                            e.code,
                            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                        )
                );
                busy || message_looks_transient(message)
            }
            _ => false,
        }
    }

    /// Classify this error for retry purposes.
    pub fn class(&self) -> ErrorClass {
        if self.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }

    /// Render the error with its full source chain.
    ///
    /// Used for debug log lines, where the chain stands in for a stack trace.
    pub fn detailed(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str(": ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReconcileError::validation("license_key", "must be a string");
        assert_eq!(
            err.to_string(),
            "Validation error for license_key: must be a string"
        );
    }

    #[test]
    fn test_typed_transient_errors() {
        assert!(ReconcileError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(ReconcileError::network("socket closed").is_transient());
        assert!(ReconcileError::RateLimited {
            retry_after_ms: None
        }
        .is_transient());
        assert!(!ReconcileError::Paused.is_transient());
        assert!(!ReconcileError::validation("id", "empty").is_transient());
    }

    #[test]
    fn test_message_classification() {
        assert!(ReconcileError::store("commit", "Connection reset by peer").is_transient());
        assert!(ReconcileError::store("probe", "service UNAVAILABLE").is_transient());
        assert!(ReconcileError::Other("Deadline exceeded".into()).is_transient());
        assert!(!ReconcileError::store("commit", "permission denied").is_transient());
        assert_eq!(
            ReconcileError::store("commit", "document too large").class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_detailed_includes_source() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ReconcileError::from(json_err);
        assert!(err.detailed().starts_with("JSON error:"));
    }
}

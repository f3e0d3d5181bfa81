//! Error types for the ciflow engine.
//!
//! Every fallible operation in the crate returns [`EngineError`]. Errors are
//! classified as permanent or retryable so that backoff-wrapped operations
//! know when to stop early.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A step failed input validation before it ran.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// The skip condition of a step could not be evaluated.
    #[error("failed to evaluate skip condition: {0}")]
    SkipCondition(String),

    /// A call to an external collaborator failed with a structured status.
    #[error("{0}")]
    Remote(#[from] RemoteStatus),

    /// The requested object does not exist in the object store.
    #[error("object not found: {key}")]
    NotFound {
        /// The object key.
        key: String,
    },

    /// A downloaded object did not match its recorded content hash.
    #[error("{0}")]
    Integrity(#[from] IntegrityError),

    /// A cache key template could not be rendered.
    #[error("template error: {0}")]
    Template(String),

    /// A cache operation failed for a given key.
    #[error("{operation} failed for key {key}: {source}")]
    Cache {
        /// "save cache" or "restore cache".
        operation: &'static str,
        /// The resolved cache key.
        key: String,
        /// The underlying error.
        #[source]
        source: Box<EngineError>,
    },

    /// A step carried a payload this engine cannot dispatch.
    #[error("unexpected step kind: {0}")]
    UnexpectedStepKind(String),

    /// Releasing resources held by a step failed.
    #[error("cleanup failed for step {step_id}: {message}")]
    Cleanup {
        /// The step being cleaned up.
        step_id: String,
        /// What went wrong.
        message: String,
    },

    /// Required configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A background task could not be joined.
    #[error("task join error: {0}")]
    Join(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Wraps an error as a cache failure for `key`.
    #[must_use]
    pub fn cache(operation: &'static str, key: impl Into<String>, source: Self) -> Self {
        Self::Cache {
            operation,
            key: key.into(),
            source: Box::new(source),
        }
    }

    /// Returns the structured remote status carried by this error, if any.
    ///
    /// Cache errors are unwrapped so the innermost remote status is found.
    #[must_use]
    pub fn remote_status(&self) -> Option<&RemoteStatus> {
        match self {
            Self::Remote(status) => Some(status),
            Self::Cache { source, .. } => source.remote_status(),
            _ => None,
        }
    }

    /// The message reported to the controller for a failed step.
    #[must_use]
    pub fn status_message(&self) -> String {
        self.remote_status()
            .map_or_else(|| self.to_string(), |status| status.message.clone())
    }

    /// Returns true if retrying the failed operation cannot succeed.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Validation(_)
            | Self::SkipCondition(_)
            | Self::Integrity(_)
            | Self::Template(_)
            | Self::UnexpectedStepKind(_)
            | Self::Config(_)
            | Self::Serialization(_) => true,
            Self::Remote(status) => status.code.is_permanent(),
            Self::Cache { source, .. } => source.is_permanent(),
            Self::NotFound { .. }
            | Self::Cleanup { .. }
            | Self::Join(_)
            | Self::Io(_) => false,
        }
    }
}

/// Error raised when a step is missing a required field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field} is not set for step {step}")]
pub struct ValidationError {
    /// The offending field (e.g. "step ID", "callback token").
    pub field: String,
    /// The step id, or a placeholder if the id itself is missing.
    pub step: String,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(field: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            step: step.into(),
        }
    }
}

/// Error raised when a downloaded file's hash differs from the stored one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("content hash mismatch for {path}: expected {expected}, got {actual}")]
pub struct IntegrityError {
    /// Local path of the downloaded file.
    pub path: String,
    /// Hash recorded in object metadata.
    pub expected: String,
    /// Hash computed locally.
    pub actual: String,
}

/// Status codes returned by remote collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteCode {
    /// Unknown failure.
    Unknown,
    /// The request was malformed.
    InvalidArgument,
    /// The deadline expired before the call completed.
    DeadlineExceeded,
    /// The addressed entity does not exist.
    NotFound,
    /// The caller lacks permission.
    PermissionDenied,
    /// Quota or capacity exhausted.
    ResourceExhausted,
    /// The system is not in a state required for the call.
    FailedPrecondition,
    /// The call was aborted, typically due to a concurrency conflict.
    Aborted,
    /// The call is not supported by the callee.
    Unimplemented,
    /// The callee hit an internal error.
    Internal,
    /// The callee is temporarily unreachable.
    Unavailable,
    /// The caller has no valid credentials.
    Unauthenticated,
}

impl RemoteCode {
    /// Returns true if the code indicates a failure that retries cannot fix.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument
                | Self::PermissionDenied
                | Self::FailedPrecondition
                | Self::Unimplemented
                | Self::Unauthenticated
        )
    }
}

impl fmt::Display for RemoteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid argument",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::NotFound => "not found",
            Self::PermissionDenied => "permission denied",
            Self::ResourceExhausted => "resource exhausted",
            Self::FailedPrecondition => "failed precondition",
            Self::Aborted => "aborted",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::Unauthenticated => "unauthenticated",
        };
        f.write_str(name)
    }
}

/// A structured status attached to a failed remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("rpc error: code = {code} desc = {message}")]
pub struct RemoteStatus {
    /// The status code.
    pub code: RemoteCode,
    /// Human-readable message from the callee.
    pub message: String,
}

impl RemoteStatus {
    /// Creates a new remote status.
    #[must_use]
    pub fn new(code: RemoteCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for an `Unavailable` status.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteCode::Unavailable, message)
    }

    /// Shorthand for an `Internal` status.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RemoteCode::Internal, message)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_message() {
        let err = EngineError::from(ValidationError::new("callback token", "step1"));
        assert_eq!(err.to_string(), "callback token is not set for step step1");
        assert!(err.is_permanent());
    }

    #[test]
    fn test_status_message_prefers_remote_status() {
        let err = EngineError::from(RemoteStatus::unavailable("addon is down"));
        assert_eq!(err.status_message(), "addon is down");
        assert!(err.to_string().contains("unavailable"));

        let wrapped = EngineError::cache("save cache", "k1", err);
        assert_eq!(wrapped.status_message(), "addon is down");
    }

    #[test]
    fn test_status_message_falls_back_to_display() {
        let err = EngineError::Template("unknown function \"foo\"".to_string());
        assert_eq!(err.status_message(), err.to_string());
    }

    #[test]
    fn test_remote_code_classification() {
        assert!(RemoteCode::Unauthenticated.is_permanent());
        assert!(RemoteCode::InvalidArgument.is_permanent());
        assert!(!RemoteCode::Unavailable.is_permanent());
        assert!(!RemoteCode::Internal.is_permanent());
        assert!(!RemoteCode::DeadlineExceeded.is_permanent());
    }

    #[test]
    fn test_cache_error_names_key() {
        let err = EngineError::cache(
            "restore cache",
            "deps-abc",
            EngineError::NotFound { key: "deps-abc".to_string() },
        );
        let msg = err.to_string();
        assert!(msg.contains("restore cache failed for key deps-abc"));
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_remote_code_serialize() {
        let json = serde_json::to_string(&RemoteCode::DeadlineExceeded).unwrap();
        assert_eq!(json, r#""DEADLINE_EXCEEDED""#);
    }
}

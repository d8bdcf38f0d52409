//! Reconciliation error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::classify::{ApiError, Outcome};

/// Errors surfaced by waits, phase runs and retried mutations.
///
/// Every variant names the object and the operation being attempted, so a
/// failure is never reported without context.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The remote object is gone while some other state was expected.
    #[error("{operation} {object}: not found: {source}")]
    NotFound {
        object: String,
        operation: String,
        source: ApiError,
    },

    /// 409-class conflict reported by the remote API.
    #[error("{operation} {object}: conflict: {source}")]
    Conflict {
        object: String,
        operation: String,
        retryable: bool,
        source: ApiError,
    },

    /// 5xx-class failure that outlasted the retry budget.
    #[error("{operation} {object}: server error: {source}")]
    ServerTransient {
        object: String,
        operation: String,
        source: ApiError,
    },

    /// Bad request, authorization failure, cancellation.
    #[error("{operation} {object}: {source}")]
    Fatal {
        object: String,
        operation: String,
        source: ApiError,
    },

    /// The object reported a state that was neither pending nor a target.
    #[error("{operation} {object}: unexpected state '{label}' while waiting for {target}")]
    UnexpectedState {
        object: String,
        operation: String,
        label: String,
        target: String,
    },

    /// The deadline passed while the object was still pending.
    #[error(
        "{operation} {object}: timed out after {timeout:?} waiting for {target} (last state: {})",
        .last_label.as_deref().unwrap_or("none")
    )]
    Timeout {
        object: String,
        operation: String,
        timeout: Duration,
        target: String,
        last_label: Option<String>,
    },

    /// A phase was requested in a state that does not allow it.
    #[error("{operation} {object}: changes are prohibited while status is '{label}'")]
    Prohibited {
        object: String,
        operation: String,
        label: String,
    },

    /// The wait itself was declared inconsistently.
    #[error("{operation} {object}: invalid wait: {message}")]
    InvalidWait {
        object: String,
        operation: String,
        message: String,
    },
}

impl ReconcileError {
    /// Whether the whole operation may be attempted again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Conflict { retryable, .. } => *retryable,
            ReconcileError::ServerTransient { .. } => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::NotFound { .. })
    }

    pub fn object(&self) -> &str {
        match self {
            ReconcileError::NotFound { object, .. }
            | ReconcileError::Conflict { object, .. }
            | ReconcileError::ServerTransient { object, .. }
            | ReconcileError::Fatal { object, .. }
            | ReconcileError::UnexpectedState { object, .. }
            | ReconcileError::Timeout { object, .. }
            | ReconcileError::Prohibited { object, .. }
            | ReconcileError::InvalidWait { object, .. } => object,
        }
    }

    pub fn operation(&self) -> &str {
        match self {
            ReconcileError::NotFound { operation, .. }
            | ReconcileError::Conflict { operation, .. }
            | ReconcileError::ServerTransient { operation, .. }
            | ReconcileError::Fatal { operation, .. }
            | ReconcileError::UnexpectedState { operation, .. }
            | ReconcileError::Timeout { operation, .. }
            | ReconcileError::Prohibited { operation, .. }
            | ReconcileError::InvalidWait { operation, .. } => operation,
        }
    }

    /// Last state label observed before a timeout or unexpected state.
    pub fn last_label(&self) -> Option<&str> {
        match self {
            ReconcileError::Timeout { last_label, .. } => last_label.as_deref(),
            ReconcileError::UnexpectedState { label, .. }
            | ReconcileError::Prohibited { label, .. } => Some(label),
            _ => None,
        }
    }

    /// Underlying remote error for classified failures.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            ReconcileError::NotFound { source, .. }
            | ReconcileError::Conflict { source, .. }
            | ReconcileError::ServerTransient { source, .. }
            | ReconcileError::Fatal { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// The object and operation an error is reported against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub object: String,
    pub operation: String,
}

impl Subject {
    pub fn new(object: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            operation: operation.into(),
        }
    }

    /// Same object, different operation.
    pub fn with_operation(&self, operation: impl Into<String>) -> Self {
        Self {
            object: self.object.clone(),
            operation: operation.into(),
        }
    }

    /// Wrap a classified remote error.
    pub fn remote(&self, outcome: Outcome, source: ApiError) -> ReconcileError {
        let object = self.object.clone();
        let operation = self.operation.clone();
        match outcome {
            Outcome::NotFound => ReconcileError::NotFound {
                object,
                operation,
                source,
            },
            Outcome::Conflict { retryable } => ReconcileError::Conflict {
                object,
                operation,
                retryable,
                source,
            },
            Outcome::Transient => ReconcileError::ServerTransient {
                object,
                operation,
                source,
            },
            Outcome::Fatal => ReconcileError::Fatal {
                object,
                operation,
                source,
            },
        }
    }

    pub fn unexpected_state(&self, label: impl fmt::Display, target: String) -> ReconcileError {
        ReconcileError::UnexpectedState {
            object: self.object.clone(),
            operation: self.operation.clone(),
            label: label.to_string(),
            target,
        }
    }

    pub fn timeout(
        &self,
        timeout: Duration,
        target: String,
        last_label: Option<String>,
    ) -> ReconcileError {
        ReconcileError::Timeout {
            object: self.object.clone(),
            operation: self.operation.clone(),
            timeout,
            target,
            last_label,
        }
    }

    pub fn prohibited(&self, label: impl fmt::Display) -> ReconcileError {
        ReconcileError::Prohibited {
            object: self.object.clone(),
            operation: self.operation.clone(),
            label: label.to_string(),
        }
    }

    pub fn invalid_wait(&self, message: impl Into<String>) -> ReconcileError {
        ReconcileError::InvalidWait {
            object: self.object.clone(),
            operation: self.operation.clone(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operation, self.object)
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_last_state() {
        let subject = Subject::new("cluster c-1", "update");
        let err = subject.timeout(
            Duration::from_secs(60),
            "[running]".to_string(),
            Some("reconciling".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "update cluster c-1: timed out after 60s waiting for [running] (last state: reconciling)"
        );
        assert_eq!(err.last_label(), Some("reconciling"));
        assert!(!err.is_retryable());

        let err = subject.timeout(Duration::from_secs(1), "[running]".to_string(), None);
        assert!(err.to_string().ends_with("(last state: none)"));
    }

    #[test]
    fn test_remote_mapping() {
        let subject = Subject::new("volume v-1", "delete");

        let err = subject.remote(
            Outcome::Conflict { retryable: true },
            ApiError::conflict("volume_still_attached", "attached to vm-1"),
        );
        assert!(err.is_retryable());
        assert_eq!(err.object(), "volume v-1");
        assert_eq!(err.operation(), "delete");
        assert_eq!(
            err.api_error().and_then(|e| e.subtype.as_deref()),
            Some("volume_still_attached")
        );

        let err = subject.remote(Outcome::NotFound, ApiError::not_found("gone"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "delete volume v-1: not found: HTTP 404: gone");

        let err = subject.remote(Outcome::Transient, ApiError::unavailable("busy"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_prohibited_message() {
        let err = Subject::new("cluster c-1", "upgrade-template").prohibited("reconciling");
        assert_eq!(
            err.to_string(),
            "upgrade-template cluster c-1: changes are prohibited while status is 'reconciling'"
        );
    }
}

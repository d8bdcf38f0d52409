//! Outcome classification for remote API errors.
//!
//! Every refresh or mutation failure is mapped onto one of four outcomes.
//! The poll engine uses the outcome to decide whether a refresh error ends
//! a wait; the retry wrapper uses it to decide whether a one-shot mutation
//! may be issued again.
//!
//! Which conflict subtypes resolve on their own differs between resource
//! families, so the table lives in a [`Classifier`] value that each family
//! builds for itself.

use std::collections::HashSet;
use std::fmt;

/// Status codes that are always safe to retry.
const TRANSIENT_STATUS: [u16; 4] = [500, 502, 503, 504];

/// Raw error returned by a remote object accessor or mutation invoker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP-like status code, if the failure came from the remote API.
    pub status: Option<u16>,
    /// Machine-readable error subtype embedded in the response body.
    pub subtype: Option<String>,
    /// Human readable message.
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            subtype: None,
            message: message.into(),
        }
    }

    /// Attach a machine-readable subtype (e.g. `volume_still_attached`).
    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn conflict(subtype: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(409, message).with_subtype(subtype)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(503, message)
    }

    /// The caller's context was cancelled. Always fatal, so a refresh
    /// closure can stop an in-flight wait by returning this.
    pub fn cancelled() -> Self {
        Self {
            status: None,
            subtype: Some("cancelled".to_string()),
            message: "operation cancelled".to_string(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.subtype) {
            (Some(status), Some(subtype)) => {
                write!(f, "HTTP {} ({}): {}", status, subtype, self.message)
            }
            (Some(status), None) => write!(f, "HTTP {}: {}", status, self.message),
            (None, Some(subtype)) => write!(f, "{} ({})", self.message, subtype),
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ApiError {}

/// Classified outcome of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The remote object does not exist (any more).
    NotFound,
    /// 409-class conflict. `retryable` is decided by the subtype table.
    Conflict { retryable: bool },
    /// Server-side 5xx failure.
    Transient,
    /// Anything else: bad request, authorization, cancellation.
    Fatal,
}

impl Outcome {
    /// Whether the failed call may be issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Outcome::Transient | Outcome::Conflict { retryable: true })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::NotFound => f.write_str("not found"),
            Outcome::Conflict { retryable: true } => f.write_str("transient conflict"),
            Outcome::Conflict { retryable: false } => f.write_str("conflict"),
            Outcome::Transient => f.write_str("transient"),
            Outcome::Fatal => f.write_str("fatal"),
        }
    }
}

/// Maps [`ApiError`]s to [`Outcome`]s using a per-family table of
/// error subtypes known to resolve without intervention.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    retryable_subtypes: HashSet<String>,
}

impl Classifier {
    /// Classifier with an empty subtype table: only 5xx errors are retryable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a subtype that resolves on its own (e.g. "still attached").
    pub fn retry_conflict(mut self, subtype: impl Into<String>) -> Self {
        self.retryable_subtypes.insert(subtype.into());
        self
    }

    pub fn is_retryable_subtype(&self, subtype: &str) -> bool {
        self.retryable_subtypes.contains(subtype)
    }

    pub fn classify(&self, err: &ApiError) -> Outcome {
        let known_subtype = err
            .subtype
            .as_deref()
            .is_some_and(|s| self.is_retryable_subtype(s));

        match err.status {
            Some(404) => Outcome::NotFound,
            Some(409) => Outcome::Conflict {
                retryable: known_subtype,
            },
            Some(status) if TRANSIENT_STATUS.contains(&status) => Outcome::Transient,
            Some(status) if (400..500).contains(&status) && known_subtype => Outcome::Transient,
            _ => Outcome::Fatal,
        }
    }
}

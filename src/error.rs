//! Error types for GTM Factory
//!
//! One error enum covers every failure mode of the session/drop lifecycle.
//! `NotFound` is an expected outcome for optional artifacts and is usually
//! folded into a default by the caller; everything else is meant to reach the
//! drop pipeline, which records it in the drop's persisted state.

use crate::drop::DropState;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for GTM Factory operations
pub type Result<T> = std::result::Result<T, GtmError>;

/// Error type for GTM Factory operations
#[derive(Error, Debug)]
pub enum GtmError {
    /// A requested artifact does not exist in the store
    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Agent output could not be parsed into the required schema
    #[error("Malformed extraction: {0}")]
    MalformedExtraction(String),

    /// A single research assignment failed definitively
    #[error("Assignment {researcher_id} failed: {reason}")]
    AssignmentFailure {
        researcher_id: String,
        reason: String,
    },

    /// A synthesis pass was asked to run with nothing to synthesize
    #[error("Empty input: {0}")]
    EmptyInput(String),

    /// The operator asked for the current drop to stop
    #[error("Cancellation requested")]
    CancellationRequested,

    /// An atomic write did not complete; the previous version is intact
    #[error("Write failed for {}: {reason}", .path.display())]
    WriteFailed { path: PathBuf, reason: String },

    /// A persisted artifact exists but cannot be interpreted
    #[error("Corrupt artifact {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Drop state change not allowed by the lifecycle
    #[error("Invalid transition for {drop_id}: {from} -> {to}")]
    InvalidTransition {
        drop_id: String,
        from: DropState,
        to: DropState,
    },

    /// A drop with this identifier was already created
    #[error("Drop already exists: {0}")]
    DropExists(String),

    /// Store paths must be relative and stay under the root
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Conversational agent errors
    #[error("Agent error: {0}")]
    Agent(String),

    /// Transient research engine errors (retried)
    #[error("Research error: {0}")]
    Research(String),

    /// Rate limited (with retry-after duration in seconds)
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl GtmError {
    /// Whether this error means the artifact is simply absent
    pub fn is_not_found(&self) -> bool {
        match self {
            GtmError::NotFound(_) => true,
            GtmError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl crate::integrations::retry::RetryableError for GtmError {
    fn retry_decision(&self) -> crate::integrations::retry::RetryDecision {
        use crate::integrations::retry::RetryDecision;
        use std::time::Duration;

        match self {
            GtmError::Research(_) => RetryDecision::Retry,
            GtmError::RateLimited(secs) => RetryDecision::RetryAfter(Duration::from_secs(*secs)),
            GtmError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    RetryDecision::Retry
                } else if let Some(status) = e.status() {
                    match status.as_u16() {
                        429 => RetryDecision::RetryAfter(Duration::from_secs(60)),
                        500..=599 => RetryDecision::Retry,
                        _ => RetryDecision::NoRetry,
                    }
                } else if e.is_decode() || e.is_builder() {
                    RetryDecision::NoRetry
                } else {
                    RetryDecision::Retry
                }
            }
            GtmError::Agent(msg) => {
                if msg.contains("overloaded") || msg.contains("timeout") {
                    RetryDecision::Retry
                } else {
                    RetryDecision::NoRetry
                }
            }
            GtmError::NotFound(_)
            | GtmError::MalformedExtraction(_)
            | GtmError::AssignmentFailure { .. }
            | GtmError::EmptyInput(_)
            | GtmError::CancellationRequested
            | GtmError::WriteFailed { .. }
            | GtmError::Corrupt { .. }
            | GtmError::InvalidTransition { .. }
            | GtmError::DropExists(_)
            | GtmError::InvalidPath(_)
            | GtmError::Config(_)
            | GtmError::Io(_)
            | GtmError::Json(_)
            | GtmError::Yaml(_)
            | GtmError::Other(_)
            | GtmError::Anyhow(_) => RetryDecision::NoRetry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::retry::{RetryDecision, RetryableError};
    use std::time::Duration;

    #[test]
    fn test_transient_research_errors_retry() {
        let err = GtmError::Research("connection reset".to_string());
        assert_eq!(err.retry_decision(), RetryDecision::Retry);

        let err = GtmError::RateLimited(7);
        assert_eq!(
            err.retry_decision(),
            RetryDecision::RetryAfter(Duration::from_secs(7))
        );
    }

    #[test]
    fn test_cancellation_never_retries() {
        assert_eq!(
            GtmError::CancellationRequested.retry_decision(),
            RetryDecision::NoRetry
        );
        let err = GtmError::AssignmentFailure {
            researcher_id: "researcher-2".to_string(),
            reason: "bad query".to_string(),
        };
        assert_eq!(err.retry_decision(), RetryDecision::NoRetry);
    }

    #[test]
    fn test_not_found_detection() {
        assert!(GtmError::NotFound(PathBuf::from("a/b.md")).is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(GtmError::Io(io).is_not_found());
        assert!(!GtmError::Other("x".to_string()).is_not_found());
    }

    #[test]
    fn test_error_messages() {
        let err = GtmError::InvalidTransition {
            drop_id: "drop-1".to_string(),
            from: DropState::Complete,
            to: DropState::Researching,
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition for drop-1: complete -> researching"
        );
    }
}

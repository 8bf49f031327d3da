/*!
 * Error types for the ingestor
 */

use std::io;

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, IngestorError>;

/// Errors raised while ingesting and transferring datasets
#[derive(Debug, Error)]
pub enum IngestorError {
    /// Missing or invalid configuration option
    #[error("configuration error: {0}")]
    Config(String),

    /// Token refresh or token exchange failure
    #[error("authentication error: {0}")]
    Auth(String),

    /// Dataset folder, metadata or file list rejected before any network I/O
    #[error("preflight check failed: {0}")]
    Preflight(String),

    /// Non-2xx response from SciCat, the broker, Globus or the object store
    #[error("{service} returned HTTP {status}: {message}{}", format_details(.details))]
    Upstream {
        service: String,
        status: u16,
        message: String,
        details: String,
    },

    /// A remote transfer service reported that the transfer failed
    #[error("{0}")]
    RemoteTransfer(String),

    /// Missing ETag, rejected checksum or rejected multipart completion
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The task context was cancelled
    #[error("task was cancelled")]
    Cancelled,

    /// Invariant violation
    #[error("internal error: {0}")]
    Internal(String),

    /// HTTP transport failure (connect, timeout, body)
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("task already exists: {0}")]
    TaskExists(Uuid),

    #[error("task queue is full")]
    QueueFull,

    /// A multipart abort failed after an earlier failure
    #[error("while aborting a multipart upload an error occurred: {abort}. Previous error: {cause}")]
    AbortFailed {
        abort: String,
        cause: Box<IngestorError>,
    },

    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<IngestorError>,
    },
}

fn format_details(details: &str) -> String {
    if details.is_empty() {
        String::new()
    } else {
        format!(" ({})", details)
    }
}

/// Error category, mirroring how a task reacts to the failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Auth,
    Preflight,
    Upstream,
    Integrity,
    Cancelled,
    Internal,
}

impl IngestorError {
    /// Build an upstream error from a status code and response body
    pub fn upstream(service: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        IngestorError::Upstream {
            service: service.into(),
            status,
            message: message.into(),
            details: String::new(),
        }
    }

    /// Wrap the error with a context message
    pub fn context(self, context: impl Into<String>) -> Self {
        IngestorError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            IngestorError::Config(_) => ErrorCategory::Config,
            IngestorError::Auth(_) => ErrorCategory::Auth,
            IngestorError::Preflight(_) => ErrorCategory::Preflight,
            IngestorError::Upstream { .. }
            | IngestorError::Transport(_)
            | IngestorError::RemoteTransfer(_) => ErrorCategory::Upstream,
            IngestorError::Integrity(_) => ErrorCategory::Integrity,
            IngestorError::Cancelled => ErrorCategory::Cancelled,
            IngestorError::AbortFailed { cause, .. } => cause.category(),
            IngestorError::WithContext { source, .. } => source.category(),
            IngestorError::Io(_)
            | IngestorError::Serialization(_)
            | IngestorError::Internal(_)
            | IngestorError::TaskNotFound(_)
            | IngestorError::TaskExists(_)
            | IngestorError::QueueFull => ErrorCategory::Internal,
        }
    }

    /// Whether a retrying client should try the request again
    ///
    /// Transport failures, HTTP 5xx and HTTP 429 are transient; everything
    /// else is returned to the caller on the first occurrence.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestorError::Transport(_) => true,
            IngestorError::Upstream { status, .. } => *status >= 500 || *status == 429,
            IngestorError::WithContext { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether the error was caused by task cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            IngestorError::Cancelled => true,
            IngestorError::AbortFailed { cause, .. } => cause.is_cancelled(),
            IngestorError::WithContext { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for IngestorError {
    fn from(err: reqwest::Error) -> Self {
        IngestorError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for IngestorError {
    fn from(err: serde_json::Error) -> Self {
        IngestorError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_display_contains_status() {
        let err = IngestorError::upstream("object store", 500, "Internal Server Error");
        let msg = err.to_string();
        assert!(msg.contains("500"), "message should carry the status: {}", msg);
        assert!(msg.contains("object store"));
    }

    #[test]
    fn test_upstream_display_with_details() {
        let err = IngestorError::Upstream {
            service: "globus".into(),
            status: 409,
            message: "conflict".into(),
            details: "task exists".into(),
        };
        assert_eq!(err.to_string(), "globus returned HTTP 409: conflict (task exists)");
    }

    #[test]
    fn test_transient_classification() {
        assert!(IngestorError::upstream("broker", 503, "").is_transient());
        assert!(IngestorError::upstream("broker", 429, "").is_transient());
        assert!(!IngestorError::upstream("broker", 403, "").is_transient());
        assert!(IngestorError::Transport("reset".into()).is_transient());
        assert!(!IngestorError::Integrity("no etag".into()).is_transient());
        assert!(!IngestorError::Cancelled.is_transient());
    }

    #[test]
    fn test_cancellation_seen_through_wrappers() {
        let err = IngestorError::AbortFailed {
            abort: "broker down".into(),
            cause: Box::new(IngestorError::Cancelled.context("part 2")),
        };
        assert!(err.is_cancelled());
        assert_eq!(err.category(), ErrorCategory::Cancelled);
    }

    #[test]
    fn test_abort_failure_keeps_cause() {
        let err = IngestorError::AbortFailed {
            abort: "HTTP 502".into(),
            cause: Box::new(IngestorError::upstream("object store", 500, "boom")),
        };
        let msg = err.to_string();
        assert!(msg.contains("HTTP 502"));
        assert!(msg.contains("Previous error: object store returned HTTP 500: boom"));
    }
}

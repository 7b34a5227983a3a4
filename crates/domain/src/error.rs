use serde::{Deserialize, Serialize};

/// Shared error type used across all Butler crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed input or schema mismatch. Surfaced synchronously, never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// Retriable I/O or rate-limit failure. Becomes `Permanent` once the
    /// retry policy is exhausted.
    #[error("transient: {0}")]
    Transient(String),

    /// Non-retriable external failure. Terminates the task as failed.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Normal signal from an interrupt or timeout. Terminates as cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The scheduler refused a new spawn. The caller decides to retry later.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// LLM output format violation.
    #[error("parse: {0}")]
    Parse(String),

    /// A referenced entity (task, tool, workflow, conversation) does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify into the wire-level error kind recorded on tasks and messages.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Transient(_) => ErrorKind::Transient,
            Error::Json(_) | Error::Parse(_) => ErrorKind::Parse,
            Error::Validation(_) | Error::NotFound(_) => ErrorKind::Validation,
            Error::Permanent(_) => ErrorKind::Permanent,
            Error::Cancelled(_) => ErrorKind::Cancellation,
            Error::Backpressure(_) => ErrorKind::Backpressure,
        }
    }

    /// Transient errors may be retried per policy; everything else may not.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Collapse an exhausted transient error into a permanent one, keeping
    /// the original message.
    pub fn into_permanent(self) -> Error {
        match self {
            Error::Transient(msg) => Error::Permanent(msg),
            Error::Io(e) => Error::Permanent(e.to_string()),
            other => other,
        }
    }
}

/// Serializable error classification, stored on tasks and tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Transient,
    Permanent,
    Cancellation,
    Backpressure,
    Parse,
}

/// Structured error payload persisted on a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn from_error(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retriable() {
        assert!(Error::Transient("rate limited".into()).is_retriable());
        assert!(!Error::Permanent("gone".into()).is_retriable());
        assert!(!Error::Validation("bad field".into()).is_retriable());
        assert!(!Error::Cancelled("interrupt".into()).is_retriable());
    }

    #[test]
    fn kinds_map_to_taxonomy() {
        assert_eq!(Error::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(Error::Backpressure("x".into()).kind(), ErrorKind::Backpressure);
        assert_eq!(Error::Parse("x".into()).kind(), ErrorKind::Parse);
        assert_eq!(Error::Cancelled("x".into()).kind(), ErrorKind::Cancellation);
    }

    #[test]
    fn exhausted_transient_becomes_permanent() {
        let err = Error::Transient("socket reset".into()).into_permanent();
        assert!(matches!(err, Error::Permanent(_)));
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn task_error_from_error_keeps_message() {
        let err = Error::Permanent("upstream 502".into());
        let te = TaskError::from_error(&err);
        assert_eq!(te.kind, ErrorKind::Permanent);
        assert!(te.message.contains("upstream 502"));
    }

    #[test]
    fn error_kind_snake_case_serialization() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::Cancellation).unwrap(),
            "\"cancellation\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::Backpressure).unwrap(),
            "\"backpressure\""
        );
    }
}

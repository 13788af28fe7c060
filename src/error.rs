//! Error types for the context repository engine.
//!
//! Three-layer shape, mirroring the teacher crate's error design:
//! - `Error` — the `thiserror`-derived enum used for `?`-propagation.
//! - `ErrorCode` — a machine-readable code plus a category grouping,
//!   independent of the specific message text.
//! - `Error::hint()` / `Error::to_structured_json()` — agent-facing
//!   recovery hints and a structured JSON envelope for non-TTY callers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The eight machine-readable error kinds named by the specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    FailedPrecondition,
    ResourceExhausted,
    DeadlineExceeded,
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether a caller can plausibly retry after correcting its input.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::InvalidArgument | Self::FailedPrecondition)
    }
}

/// Errors produced by the context repository engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("session not found: {id}")]
    SessionNotFound { id: String },

    #[error("context item not found: {key} in session {session_id}")]
    ItemNotFound { session_id: String, key: String },

    #[error("checkpoint not found: {id}")]
    CheckpointNotFound { id: String },

    #[error("relationship not found: {id}")]
    RelationshipNotFound { id: String },

    #[error("watcher not found: {id}")]
    WatcherNotFound { id: String },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::SessionNotFound { .. }
            | Self::ItemNotFound { .. }
            | Self::CheckpointNotFound { .. }
            | Self::RelationshipNotFound { .. }
            | Self::WatcherNotFound { .. } => ErrorCode::NotFound,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Self::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Self::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            Self::Database(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Context-aware recovery hint, or `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::SessionNotFound { .. } => {
                Some("use session_list to see available sessions".to_string())
            }
            Self::ItemNotFound { session_id, .. } => Some(format!(
                "no visible item with that key for session {session_id} — check spelling or privacy"
            )),
            Self::CheckpointNotFound { .. } => {
                Some("use checkpoint list to see available checkpoints".to_string())
            }
            Self::InvalidArgument(msg) if msg.contains("key") => {
                Some("keys allow letters, digits, and _ - . / :, up to 255 chars".to_string())
            }
            Self::ResourceExhausted(msg) if msg.contains("batch") => {
                Some("split the request into batches of 100 items or fewer".to_string())
            }
            _ => None,
        }
    }

    /// Process exit code for a fatal top-level error (spec §6: zero on
    /// normal termination, non-zero when storage initialization fails).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        1
    }

    /// Structured JSON representation for machine consumption.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_variants_map_to_not_found_code() {
        let e = Error::SessionNotFound { id: "s1".into() };
        assert_eq!(e.error_code(), ErrorCode::NotFound);
        assert!(!e.error_code().is_retryable());
    }

    #[test]
    fn invalid_argument_is_retryable() {
        let e = Error::InvalidArgument("empty key".into());
        assert!(e.error_code().is_retryable());
        assert_eq!(e.error_code().as_str(), "INVALID_ARGUMENT");
    }

    #[test]
    fn structured_json_includes_hint_when_present() {
        let e = Error::CheckpointNotFound { id: "cp1".into() };
        let json = e.to_structured_json();
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert!(json["error"]["hint"].is_string());
    }
}

//! Shared error kinds for the registry engine.
//!
//! Every crate in the workspace converts its own errors into one of these
//! variants at its public boundary, so a caller driving the façade only
//! ever has to match on one error type (§7 of the design).

use thiserror::Error;

/// The stable, typed error surface callers observe (§6 error codes, §7
/// error kinds).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed for event {event_guid:?}: {message}")]
    Validation {
        message: String,
        event_guid: Option<String>,
    },

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("event guid already exists: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("sync is blocked by {count} unresolved duplicate pair(s)")]
    DuplicatesPending { count: usize },

    #[error("merkle integrity violation: {0}")]
    Integrity(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage backend unavailable: {0}")]
    Storage(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            event_guid: None,
        }
    }

    pub fn validation_for(message: impl Into<String>, event_guid: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            event_guid: Some(event_guid.into()),
        }
    }

    /// Stable string tag matching §6's "Error codes surfaced to callers".
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "InvalidOperation",
            Self::NotFound(_) => "EntityNotFound",
            Self::Conflict(_) => "Conflict",
            Self::Unauthorized(_) => "Unauthorized",
            Self::DuplicatesPending { .. } => "DuplicatesPending",
            Self::Integrity(_) => "IntegrityViolation",
            Self::Transport(_) => "TransportFailure",
            Self::Storage(_) => "StorageUnavailable",
            Self::UnknownEventType(_) => "UnknownEventType",
            Self::InvalidOperation(_) => "InvalidOperation",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

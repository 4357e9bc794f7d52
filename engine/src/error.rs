//! Error types for the Ward engine.

use crate::{EntityName, RecordId, SessionId};
use thiserror::Error;

/// Broad classes of failure, used by callers to decide how much work to
/// throw away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Session setup cannot proceed; nothing has been done yet.
    Scope,
    /// A snapshot pass failed; no part of it was retained.
    Isolation,
    /// An import batch was rejected as a whole.
    Conflict,
    /// A single incoming record was malformed.
    Validation,
    /// The sync session is unknown, finished, errored or timed out.
    Session,
    /// A pagination token could not be understood.
    Cursor,
}

/// All possible errors from the Ward engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Setup errors
    #[error("unresolvable channel '{descriptor}': {reason}")]
    Scope { descriptor: String, reason: String },

    #[error("unknown entity type: {0}")]
    UnknownEntity(EntityName),

    #[error("entity type '{0}' does not take part in sync")]
    NotSynced(EntityName),

    // Snapshot errors
    #[error("snapshot query for '{entity}' failed: {reason}")]
    IsolationViolation { entity: EntityName, reason: String },

    // Import errors
    #[error("edit to deleted record {entity}/{id} without a delete marker")]
    Conflict { entity: EntityName, id: RecordId },

    #[error("record {entity}/{id} not found")]
    RecordNotFound { entity: EntityName, id: RecordId },

    #[error("incoming record is missing a stable id")]
    MissingId,

    #[error("invalid payload for {id}: {reason}")]
    InvalidPayload { id: RecordId, reason: String },

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Session errors
    #[error("sync session '{0}' not found")]
    SessionNotFound(SessionId),

    #[error("sync session '{0}' is already completed")]
    SessionCompleted(SessionId),

    #[error("sync session '{id}' encountered an error: {message}")]
    SessionErrored { id: SessionId, message: String },

    #[error("snapshot for sync session '{0}' is not complete")]
    SnapshotNotReady(SessionId),

    // Pagination errors
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Scope { .. } | Error::UnknownEntity(_) | Error::NotSynced(_) => ErrorKind::Scope,
            Error::IsolationViolation { .. } => ErrorKind::Isolation,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::RecordNotFound { .. }
            | Error::MissingId
            | Error::InvalidPayload { .. }
            | Error::MissingRequiredField(_)
            | Error::TypeMismatch { .. } => ErrorKind::Validation,
            Error::SessionNotFound(_)
            | Error::SessionCompleted(_)
            | Error::SessionErrored { .. }
            | Error::SnapshotNotReady(_) => ErrorKind::Session,
            Error::InvalidCursor(_) => ErrorKind::Cursor,
        }
    }

    pub(crate) fn scope(descriptor: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Scope {
            descriptor: descriptor.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownEntity("encounter".into());
        assert_eq!(err.to_string(), "unknown entity type: encounter");

        let err = Error::Conflict {
            entity: "patient".into(),
            id: "p-1".into(),
        };
        assert_eq!(
            err.to_string(),
            "edit to deleted record patient/p-1 without a delete marker"
        );

        let err = Error::TypeMismatch {
            field: "age".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'age': expected Int, got String"
        );
    }

    #[test]
    fn error_kinds() {
        assert_eq!(Error::scope("x/y", "bad").kind(), ErrorKind::Scope);
        assert_eq!(Error::MissingId.kind(), ErrorKind::Validation);
        assert_eq!(
            Error::IsolationViolation {
                entity: "labTest".into(),
                reason: "boom".into()
            }
            .kind(),
            ErrorKind::Isolation
        );
        assert_eq!(
            Error::SessionNotFound(SessionId::nil()).kind(),
            ErrorKind::Session
        );
        assert_eq!(Error::InvalidCursor("?".into()).kind(), ErrorKind::Cursor);
    }
}

//! Error types for the Concord core.

use crate::{ObjectId, TypeTag};
use thiserror::Error;

/// All possible errors from the reconciliation layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The store has no document for this object.
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// A live instance is already registered under this ID.
    #[error("object already registered: {0}")]
    DuplicateObject(ObjectId),

    /// No constructor/loader registered for this type tag.
    #[error("unknown object type: {0}")]
    UnknownType(TypeTag),

    /// The store rejected a write or delete because the revision token
    /// was stale.
    #[error("revision conflict on object: {0}")]
    RevisionConflict(ObjectId),

    /// A change-log could not be applied (malformed entries, or a log
    /// addressed to a different object).
    #[error("invalid change-log: {0}")]
    InvalidChangeLog(String),

    /// Transport or storage failure.
    #[error("store I/O error: {0}")]
    Io(String),

    /// The instance was removed and must not be used again.
    #[error("object has been removed: {0}")]
    ObjectRemoved(ObjectId),
}

impl Error {
    /// Whether a reconciliation pass that failed with this error should be
    /// re-attempted.
    ///
    /// Revision conflicts and I/O failures are transient: the store is
    /// expected to settle and a repeated pass can succeed. Missing documents,
    /// unknown types and malformed logs will not fix themselves.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RevisionConflict(_) | Error::Io(_))
    }
}

/// Result type for reconciliation-layer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::NotFound("obj-1".into());
        assert_eq!(err.to_string(), "object not found: obj-1");

        let err = Error::UnknownType("Note".into());
        assert_eq!(err.to_string(), "unknown object type: Note");

        let err = Error::RevisionConflict("obj-1".into());
        assert_eq!(err.to_string(), "revision conflict on object: obj-1");
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::Io("boom".into()).is_retryable());
        assert!(Error::RevisionConflict("obj-1".into()).is_retryable());
        assert!(!Error::NotFound("obj-1".into()).is_retryable());
        assert!(!Error::UnknownType("Note".into()).is_retryable());
        assert!(!Error::ObjectRemoved("obj-1".into()).is_retryable());
    }
}

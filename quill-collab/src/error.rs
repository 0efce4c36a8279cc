//! Error types shared by the engine, the coordinator and the gateway.
//!
//! Every per-operation error is local to the participant that caused it:
//! the coordinator reports it back to the sender and leaves the shared
//! document untouched.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Result alias used across the crate.
pub type CollabResult<T> = Result<T, CollabError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollabError {
    /// Malformed operation shape, rejected before transformation.
    #[error("invalid operation: {0}")]
    Validation(String),

    /// The client's version cannot be reconciled; it must call `recover`.
    #[error("client version {client_version} is outside the retained window [{oldest}, {current}]; recover required")]
    StaleClient {
        client_version: i64,
        oldest: u64,
        current: u64,
    },

    /// A transformed operation does not fit the current text.
    #[error("operation out of range: {op_end} exceeds document length {len}")]
    OutOfRange { op_end: usize, len: usize },

    /// Checkpoint or log-tail persistence failed.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// An append would leave a hole or a duplicate in the event log.
    #[error("event log expected version {expected}, got {got}")]
    LogGap { expected: u64, got: u64 },

    #[error("user {0} has not joined this document")]
    UnknownParticipant(String),

    #[error("nothing to undo for user {0}")]
    NothingToUndo(String),

    #[error("nothing to redo for user {0}")]
    NothingToRedo(String),

    /// The coordinator has shut down (evicted or failed to load).
    #[error("document {0} is closed")]
    DocumentClosed(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CollabError {
    /// Whether the client should follow up with a `recover` request.
    pub fn requires_recovery(&self) -> bool {
        matches!(self, CollabError::StaleClient { .. })
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        CollabError::Persistence(e.to_string())
    }
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        CollabError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_client_requires_recovery() {
        let err = CollabError::StaleClient {
            client_version: -1,
            oldest: 0,
            current: 4,
        };
        assert!(err.requires_recovery());
        assert!(err.to_string().contains("recover required"));
        assert!(!CollabError::Validation("x".into()).requires_recovery());
    }

    #[test]
    fn test_store_error_converts_to_persistence() {
        let err: CollabError = StoreError::Database("disk full".into()).into();
        assert_eq!(err, CollabError::Persistence("database error: disk full".into()));
    }
}

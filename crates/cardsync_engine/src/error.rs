//! Error types for the sync engine.

use cardsync_protocol::ProtocolError;
use cardsync_storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A malformed operation was rejected before it was queued or sent.
    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] ProtocolError),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A network call missed its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The remote store refused our credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A conflict is waiting for manual input.
    #[error("unresolved conflict for entity {entity_id}")]
    ConflictUnresolved {
        /// Entity the conflict is about.
        entity_id: String,
    },

    /// An operation exhausted its retries.
    #[error("operation {op_id} dead-lettered: {reason}")]
    DeadLetter {
        /// Dead-lettered operation.
        op_id: u64,
        /// Last failure reason.
        reason: String,
    },

    /// A session is already analyzing, ready or running.
    #[error("sync session {session_id} already in progress")]
    AlreadyInProgress {
        /// The active session.
        session_id: Uuid,
    },

    /// The network adapter reports that syncing is not possible.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The journal backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encoding or decoding a journal record failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The journal contains a damaged frame before its tail.
    #[error("journal corrupted at offset {offset}: {reason}")]
    JournalCorrupted {
        /// Offset of the damaged frame.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// The local store failed.
    #[error("local store error: {0}")]
    LocalStore(String),

    /// A referenced operation or conflict does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote store reported a server-side error.
    #[error("remote error: {0}")]
    Remote(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Remote(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error must end the current session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::AuthenticationFailed(_)
                | SyncError::Storage(_)
                | SyncError::Codec(_)
                | SyncError::JournalCorrupted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Remote("internal error".into()).is_retryable());
        assert!(!SyncError::AuthenticationFailed("expired token".into()).is_retryable());
        assert!(!SyncError::NetworkUnavailable.is_retryable());
    }

    #[test]
    fn fatal_errors() {
        assert!(SyncError::AuthenticationFailed("expired token".into()).is_fatal());
        assert!(SyncError::JournalCorrupted {
            offset: 12,
            reason: "bad magic".into()
        }
        .is_fatal());
        assert!(!SyncError::Timeout.is_fatal());
        assert!(!SyncError::LocalStore("locked".into()).is_fatal());
    }

    #[test]
    fn protocol_errors_become_invalid_operations() {
        let err: SyncError = ProtocolError::MissingEntityId { op_id: 7 }.into();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
        assert!(err.to_string().contains("no entity id"));
    }

    #[test]
    fn error_display() {
        let err = SyncError::NetworkUnavailable;
        assert_eq!(err.to_string(), "network unavailable");

        let err = SyncError::DeadLetter {
            op_id: 23,
            reason: "missing payload".into(),
        };
        assert!(err.to_string().contains("23"));
    }
}

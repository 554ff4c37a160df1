//! Protocol validation errors.

use thiserror::Error;

/// Result type for protocol validation.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Reasons a protocol value is malformed or a transition is refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The operation does not name an entity.
    #[error("operation {op_id} has no entity id")]
    MissingEntityId {
        /// Offending operation.
        op_id: u64,
    },

    /// A create or update carries no snapshot.
    #[error("{op_type} operation {op_id} has no payload")]
    MissingPayload {
        /// Offending operation.
        op_id: u64,
        /// Operation type name.
        op_type: String,
    },

    /// The payload describes a different entity than the operation.
    #[error("operation {op_id} targets {expected} but its payload is {found}")]
    PayloadMismatch {
        /// Offending operation.
        op_id: u64,
        /// `kind/id` named by the operation.
        expected: String,
        /// `kind/id` found in the payload.
        found: String,
    },

    /// A resolved conflict was asked to change.
    #[error("conflict {0} is already resolved")]
    ConflictClosed(String),

    /// A textual enum value was not recognised.
    #[error("unknown {kind} '{value}'")]
    UnknownValue {
        /// Enum being parsed.
        kind: &'static str,
        /// The rejected text.
        value: String,
    },
}

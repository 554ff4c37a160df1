//! Messages exchanged with the remote store.

use crate::entity::{EntityKind, EntitySnapshot};
use crate::operation::SyncOperation;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Direction of a batch transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Local operations travel to the remote store.
    Push,
    /// Remote snapshots travel to the local store.
    Pull,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        })
    }
}

/// A group of operations sent in one network call.
///
/// For [`Direction::Push`] every operation carries the mutation to apply.
/// For [`Direction::Pull`] operations only name the entities whose current
/// snapshot is wanted; the remote answers each with
/// [`AckOutcome::Applied`] holding the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Batch id, echoed in the acknowledgement.
    pub batch_id: Uuid,
    /// Sending device.
    pub device_id: String,
    /// Transfer direction.
    pub direction: Direction,
    /// Operations in the batch.
    pub operations: Vec<SyncOperation>,
    /// Whether the transport should compress the body.
    pub compress: bool,
}

impl BatchRequest {
    /// Creates a batch with a fresh id.
    pub fn new(
        device_id: impl Into<String>,
        direction: Direction,
        operations: Vec<SyncOperation>,
    ) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            device_id: device_id.into(),
            direction,
            operations,
            compress: false,
        }
    }

    /// Sets the compression hint.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if the batch carries nothing.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Approximate size of the batch on the wire, for throughput accounting.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

/// Per-operation outcome reported by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum AckOutcome {
    /// The operation was applied; `version` is the entity's new version.
    Applied {
        /// Version assigned by the remote store.
        version: u64,
        /// Current remote snapshot, when the remote returns it.
        snapshot: Option<EntitySnapshot>,
    },
    /// The remote holds a newer version than the operation's base.
    Conflict {
        /// Current remote snapshot, when the remote returns it.
        remote: Option<EntitySnapshot>,
    },
    /// The remote refused the operation.
    Rejected {
        /// Reason given by the remote.
        reason: String,
        /// Whether sending it again may succeed.
        retryable: bool,
    },
}

/// Acknowledgement of one operation of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationAck {
    /// Acknowledged operation.
    pub op_id: u64,
    /// What happened to it.
    pub outcome: AckOutcome,
}

impl OperationAck {
    /// Creates an acknowledgement.
    pub fn new(op_id: u64, outcome: AckOutcome) -> Self {
        Self { op_id, outcome }
    }
}

/// Acknowledgement of a whole batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchAck {
    /// Batch being acknowledged.
    pub batch_id: Uuid,
    /// Per-operation results.
    pub results: Vec<OperationAck>,
}

impl BatchAck {
    /// Creates an acknowledgement for `batch_id`.
    pub fn new(batch_id: Uuid, results: Vec<OperationAck>) -> Self {
        Self { batch_id, results }
    }

    /// Returns the outcome for `op_id`, if the remote reported one.
    pub fn outcome_for(&self, op_id: u64) -> Option<&AckOutcome> {
        self.results
            .iter()
            .find(|ack| ack.op_id == op_id)
            .map(|ack| &ack.outcome)
    }
}

/// Header of one remote change returned by a delta query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Kind of the changed entity.
    pub entity_kind: EntityKind,
    /// Id of the changed entity.
    pub entity_id: String,
    /// Version after the change.
    pub version: u64,
    /// Whether the change was a deletion.
    pub deleted: bool,
    /// Remote commit time in unix milliseconds; the delta cursor.
    pub changed_at_ms: u64,
}

impl RemoteChange {
    /// Returns `kind/id`.
    pub fn entity_key(&self) -> String {
        format!("{}/{}", self.entity_kind, self.entity_id)
    }
}

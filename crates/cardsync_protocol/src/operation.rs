//! Queued local mutations.

use crate::entity::{EntityKind, EntitySnapshot};
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    /// Entity was created locally.
    Create,
    /// Entity was edited locally.
    Update,
    /// Entity was deleted locally.
    Delete,
}

impl OperationType {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }

    /// Returns true if the operation must carry a snapshot.
    pub fn requires_payload(&self) -> bool {
        !matches!(self, OperationType::Delete)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drain priority. `High` drains before `Normal`, `Normal` before `Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Ordinary edits.
    #[default]
    Normal,
    /// User-visible edits that should land first.
    High,
}

impl Priority {
    /// Returns the next lower priority, saturating at `Low`.
    pub fn lowered(self) -> Self {
        match self {
            Priority::High => Priority::Normal,
            Priority::Normal | Priority::Low => Priority::Low,
        }
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    /// Waiting in the queue.
    Pending,
    /// Handed to the transfer engine.
    InFlight,
    /// Acknowledged by the remote store.
    Completed,
    /// Exhausted its retries or failed validation; lives in the dead-letter set.
    Failed,
}

impl OperationStatus {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InFlight => "in-flight",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single intended mutation waiting to reach the remote store.
///
/// `op_id` is assigned by the operation log and grows monotonically, so it
/// doubles as the FIFO position. `base_version` is the local copy's
/// last-known-synced version when the edit was made; the remote store
/// compares it against its own version to spot concurrent edits.
/// `attempt` and `next_eligible_at_ms` carry the retry schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Unique operation id.
    pub op_id: u64,
    /// Mutation type.
    pub op_type: OperationType,
    /// Kind of the target entity.
    pub entity_kind: EntityKind,
    /// Id of the target entity.
    pub entity_id: String,
    /// Entity snapshot at enqueue time.
    pub payload: Option<EntitySnapshot>,
    /// Last-known-synced version of the target.
    pub base_version: u64,
    /// Drain priority.
    pub priority: Priority,
    /// Enqueue time in unix milliseconds.
    pub enqueued_at_ms: u64,
    /// Failed transmissions so far, counted against the retry budget.
    pub attempt: u32,
    /// Lifecycle status.
    pub status: OperationStatus,
    /// Earliest time the operation may be dequeued again.
    pub next_eligible_at_ms: u64,
    /// Reason of the most recent failure.
    pub last_error: Option<String>,
}

impl SyncOperation {
    /// Creates a pending operation. The log assigns `op_id` and `enqueued_at_ms`.
    pub fn new(
        op_type: OperationType,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        payload: Option<EntitySnapshot>,
    ) -> Self {
        Self {
            op_id: 0,
            op_type,
            entity_kind,
            entity_id: entity_id.into(),
            payload,
            base_version: 0,
            priority: Priority::Normal,
            enqueued_at_ms: 0,
            attempt: 0,
            status: OperationStatus::Pending,
            next_eligible_at_ms: 0,
            last_error: None,
        }
    }

    /// Creates a `create` operation carrying `snapshot`.
    pub fn create(snapshot: EntitySnapshot) -> Self {
        Self::new(
            OperationType::Create,
            snapshot.kind,
            snapshot.id.clone(),
            Some(snapshot),
        )
    }

    /// Creates an `update` operation carrying `snapshot`.
    pub fn update(snapshot: EntitySnapshot) -> Self {
        let base_version = snapshot.version;
        Self::new(
            OperationType::Update,
            snapshot.kind,
            snapshot.id.clone(),
            Some(snapshot),
        )
        .with_base_version(base_version)
    }

    /// Creates a `delete` operation.
    pub fn delete(entity_kind: EntityKind, entity_id: impl Into<String>) -> Self {
        Self::new(OperationType::Delete, entity_kind, entity_id, None)
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the base version.
    pub fn with_base_version(mut self, base_version: u64) -> Self {
        self.base_version = base_version;
        self
    }

    /// Returns `kind/id`.
    pub fn entity_key(&self) -> String {
        format!("{}/{}", self.entity_kind, self.entity_id)
    }

    /// Checks that the operation names an entity.
    ///
    /// This is the only check applied at enqueue time.
    pub fn ensure_entity_id(&self) -> ProtocolResult<()> {
        if self.entity_id.trim().is_empty() {
            return Err(ProtocolError::MissingEntityId { op_id: self.op_id });
        }
        Ok(())
    }

    /// Full validation of an outgoing operation.
    pub fn validate(&self) -> ProtocolResult<()> {
        self.ensure_entity_id()?;

        match &self.payload {
            None if self.op_type.requires_payload() => Err(ProtocolError::MissingPayload {
                op_id: self.op_id,
                op_type: self.op_type.to_string(),
            }),
            Some(snapshot)
                if snapshot.kind != self.entity_kind || snapshot.id != self.entity_id =>
            {
                Err(ProtocolError::PayloadMismatch {
                    op_id: self.op_id,
                    expected: self.entity_key(),
                    found: snapshot.key(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: &str) -> EntitySnapshot {
        EntitySnapshot::new(EntityKind::Card, id).with_field("front", "Q")
    }

    #[test]
    fn constructors_fill_target() {
        let op = SyncOperation::update(card("c1").with_version(4)).with_priority(Priority::High);
        assert_eq!(op.op_type, OperationType::Update);
        assert_eq!(op.entity_kind, EntityKind::Card);
        assert_eq!(op.entity_id, "c1");
        assert_eq!(op.base_version, 4);
        assert_eq!(op.priority, Priority::High);
        assert_eq!(op.status, OperationStatus::Pending);

        let delete = SyncOperation::delete(EntityKind::Tag, "t1");
        assert!(delete.payload.is_none());
        assert!(delete.validate().is_ok());
    }

    #[test]
    fn priority_ordering_and_lowering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::High.lowered(), Priority::Normal);
        assert_eq!(Priority::Normal.lowered(), Priority::Low);
        assert_eq!(Priority::Low.lowered(), Priority::Low);
    }

    #[test]
    fn missing_entity_id_is_rejected() {
        let op = SyncOperation::new(OperationType::Update, EntityKind::Card, "  ", None);
        assert!(matches!(
            op.ensure_entity_id(),
            Err(ProtocolError::MissingEntityId { .. })
        ));
    }

    #[test]
    fn validation_catches_malformed_payloads() {
        let mut op = SyncOperation::create(card("c1"));
        op.payload = None;
        assert!(matches!(
            op.validate(),
            Err(ProtocolError::MissingPayload { .. })
        ));

        let mut op = SyncOperation::update(card("c1"));
        op.entity_id = "c2".into();
        assert!(matches!(
            op.validate(),
            Err(ProtocolError::PayloadMismatch { .. })
        ));
    }
}

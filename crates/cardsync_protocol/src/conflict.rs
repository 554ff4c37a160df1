//! Conflict records and resolution policies.

use crate::entity::{EntityKind, EntitySnapshot};
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// How local and remote state diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Both sides edited the entity since the last sync.
    Content,
    /// One side deleted the entity while the other edited it.
    DeleteVsUpdate,
    /// Both sides created an entity under the same id.
    ConcurrentCreate,
}

impl ConflictKind {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Content => "content",
            ConflictKind::DeleteVsUpdate => "delete-vs-update",
            ConflictKind::ConcurrentCreate => "concurrent-create",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded on a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// Not resolved yet.
    Pending,
    /// The local snapshot was kept.
    LocalWins,
    /// The remote snapshot was accepted.
    RemoteWins,
    /// A field-level merge of both snapshots.
    Merged,
    /// A value chosen by the user.
    Manual,
}

impl Resolution {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Pending => "pending",
            Resolution::LocalWins => "local-wins",
            Resolution::RemoteWins => "remote-wins",
            Resolution::Merged => "merged",
            Resolution::Manual => "manual",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy applied to newly detected conflicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// The remote snapshot always wins.
    RemoteWins,
    /// The local snapshot always wins.
    LocalWins,
    /// The most recently edited snapshot wins; remote wins ties.
    #[default]
    NewestWins,
    /// Field-level merge.
    Merge,
    /// Leave the conflict open for the user.
    Manual,
}

impl ConflictPolicy {
    /// All policies.
    pub const ALL: [ConflictPolicy; 5] = [
        ConflictPolicy::RemoteWins,
        ConflictPolicy::LocalWins,
        ConflictPolicy::NewestWins,
        ConflictPolicy::Merge,
        ConflictPolicy::Manual,
    ];

    /// Returns true if this policy settles conflicts without user input.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::RemoteWins => "remote-wins",
            ConflictPolicy::LocalWins => "local-wins",
            ConflictPolicy::NewestWins => "newest-wins",
            ConflictPolicy::Merge => "merge",
            ConflictPolicy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        ConflictPolicy::ALL
            .into_iter()
            .find(|policy| policy.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownValue {
                kind: "conflict policy",
                value: s.to_string(),
            })
    }
}

/// A detected divergence between local and remote state for one entity.
///
/// A conflict is mutable only while its resolution is
/// [`Resolution::Pending`]: re-detection refreshes the snapshots in place
/// and a failed resolution attempt bumps `retry_count`. Once closed the
/// record is frozen and moves to the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict id.
    pub id: Uuid,
    /// Kind of the entity.
    pub entity_kind: EntityKind,
    /// Id of the entity; the dedup key of the open set.
    pub entity_id: String,
    /// Local state when detected.
    pub local_snapshot: EntitySnapshot,
    /// Remote state when detected.
    pub remote_snapshot: EntitySnapshot,
    /// State both sides last agreed on, when known.
    #[serde(default)]
    pub base_snapshot: Option<EntitySnapshot>,
    /// Divergence kind.
    pub conflict_kind: ConflictKind,
    /// Current resolution.
    pub resolution: Resolution,
    /// Detection time in unix milliseconds.
    pub detected_at_ms: u64,
    /// Whether a policy closed the conflict without user input.
    pub auto_resolved: bool,
    /// Failed resolution attempts.
    pub retry_count: u32,
    /// The winning value, once resolved.
    pub resolved_value: Option<EntitySnapshot>,
    /// Resolution time in unix milliseconds.
    pub resolved_at_ms: Option<u64>,
    /// Reason of the most recent failed resolution attempt.
    pub last_error: Option<String>,
}

impl SyncConflict {
    /// Creates a pending conflict.
    pub fn new(
        local_snapshot: EntitySnapshot,
        remote_snapshot: EntitySnapshot,
        conflict_kind: ConflictKind,
        detected_at_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_kind: local_snapshot.kind,
            entity_id: local_snapshot.id.clone(),
            local_snapshot,
            remote_snapshot,
            base_snapshot: None,
            conflict_kind,
            resolution: Resolution::Pending,
            detected_at_ms,
            auto_resolved: false,
            retry_count: 0,
            resolved_value: None,
            resolved_at_ms: None,
            last_error: None,
        }
    }

    /// Attaches the last reconciled state, which lets a merge tell which
    /// side changed each field.
    pub fn with_base(mut self, base: Option<EntitySnapshot>) -> Self {
        self.base_snapshot = base;
        self
    }

    /// Returns true while the conflict awaits resolution.
    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::Pending
    }

    /// Returns `kind/id`.
    pub fn entity_key(&self) -> String {
        format!("{}/{}", self.entity_kind, self.entity_id)
    }

    /// Replaces the snapshots after the entity was detected again.
    pub fn refresh(&mut self, other: SyncConflict) -> ProtocolResult<()> {
        if !self.is_pending() {
            return Err(ProtocolError::ConflictClosed(self.id.to_string()));
        }
        self.local_snapshot = other.local_snapshot;
        self.remote_snapshot = other.remote_snapshot;
        self.base_snapshot = other.base_snapshot;
        self.conflict_kind = other.conflict_kind;
        self.detected_at_ms = other.detected_at_ms;
        Ok(())
    }

    /// Records the final resolution.
    pub fn close(
        &mut self,
        resolution: Resolution,
        resolved_value: EntitySnapshot,
        auto_resolved: bool,
        resolved_at_ms: u64,
    ) -> ProtocolResult<()> {
        if !self.is_pending() {
            return Err(ProtocolError::ConflictClosed(self.id.to_string()));
        }
        self.resolution = resolution;
        self.resolved_value = Some(resolved_value);
        self.auto_resolved = auto_resolved;
        self.resolved_at_ms = Some(resolved_at_ms);
        self.last_error = None;
        Ok(())
    }

    /// Counts a failed resolution attempt. The conflict stays pending.
    pub fn record_failure(&mut self, reason: impl Into<String>) -> ProtocolResult<()> {
        if !self.is_pending() {
            return Err(ProtocolError::ConflictClosed(self.id.to_string()));
        }
        self.retry_count += 1;
        self.last_error = Some(reason.into());
        Ok(())
    }
}

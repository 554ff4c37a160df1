//! Collaborator seams: the local store, the remote store and the optional hooks.

use crate::error::SyncResult;
use cardsync_protocol::{BatchAck, BatchRequest, EntityKind, EntitySnapshot, RemoteChange};
use std::future::Future;
use uuid::Uuid;

/// A local entity together with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    /// Current local value.
    pub snapshot: EntitySnapshot,
    /// Remote version the local copy was last reconciled with; `0` if never.
    pub synced_version: u64,
    /// Whether the user edited the entity since it was last reconciled.
    pub pending_edit: bool,
    /// Value the entity had when it was last reconciled; `None` if unknown.
    pub base: Option<EntitySnapshot>,
}

impl LocalRecord {
    /// A record that matches the remote at `version`.
    pub fn synced(snapshot: EntitySnapshot, version: u64) -> Self {
        Self {
            base: Some(snapshot.clone()),
            snapshot,
            synced_version: version,
            pending_edit: false,
        }
    }

    /// A record carrying an unsynced local edit on top of `synced_version`.
    pub fn edited(snapshot: EntitySnapshot, synced_version: u64) -> Self {
        Self {
            snapshot,
            synced_version,
            pending_edit: true,
            base: None,
        }
    }

    /// Sets the last reconciled value.
    pub fn with_base(mut self, base: Option<EntitySnapshot>) -> Self {
        self.base = base;
        self
    }
}

/// The local embedded store.
///
/// Calls are treated as fast and never yield.
pub trait LocalStore: Send + Sync {
    /// Reads an entity.
    fn get_entity(&self, kind: EntityKind, id: &str) -> SyncResult<Option<LocalRecord>>;

    /// Writes a value obtained through sync; the entity is reconciled at `version`.
    fn put_entity(&self, snapshot: EntitySnapshot, version: u64) -> SyncResult<()>;

    /// Writes a conflict resolution that still has to reach the remote.
    ///
    /// The entity stays pending on top of `base`, the remote value the
    /// conflict was resolved against.
    fn put_resolved(&self, value: EntitySnapshot, base: EntitySnapshot) -> SyncResult<()>;

    /// Lists entities carrying unsynced local edits.
    fn list_pending_local_edits(&self) -> SyncResult<Vec<LocalRecord>>;

    /// Records that a pushed edit was accepted at `version`.
    ///
    /// When `still_pending` is set the entity has later edits queued and
    /// keeps its pending flag.
    fn mark_synced(
        &self,
        kind: EntityKind,
        id: &str,
        version: u64,
        still_pending: bool,
    ) -> SyncResult<()>;
}

/// The remote store, reached over the network.
///
/// Authentication is the implementation's concern; it reports rejected
/// credentials as [`crate::SyncError::AuthenticationFailed`].
pub trait RemoteStore: Send + Sync + 'static {
    /// Lists changes committed after `since` (a `changed_at_ms` cursor).
    fn fetch_delta(&self, since: u64) -> impl Future<Output = SyncResult<Vec<RemoteChange>>> + Send;

    /// Fetches the current snapshot of an entity; `None` if it never existed.
    fn fetch_entity(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> impl Future<Output = SyncResult<Option<EntitySnapshot>>> + Send;

    /// Sends one batch and returns the per-operation outcomes.
    fn apply_batch(&self, request: BatchRequest)
        -> impl Future<Output = SyncResult<BatchAck>> + Send;
}

/// Invalidation target of the read cache.
pub trait CacheInvalidator: Send + Sync {
    /// Drops any cached copy of an entity the engine just wrote.
    fn invalidate(&self, kind: EntityKind, id: &str);
}

/// Takes and restores backups around sync sessions.
pub trait BackupHook: Send + Sync {
    /// Takes a backup before `session_id` starts.
    fn create_backup(&self, session_id: Uuid) -> SyncResult<()>;

    /// Restores the backup taken for `session_id`.
    fn restore_backup(&self, session_id: Uuid) -> SyncResult<()>;
}

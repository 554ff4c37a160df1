//! In-memory collaborators for tests and demos.
//!
//! [`MemoryLocalStore`] stands in for the embedded database and
//! [`MemoryRemoteStore`] for the network API. The remote fake enforces
//! base-version checks like a real server would and can inject transient
//! failures, authentication rejection, per-entity rejection and latency.
//! It also records how many batches overlapped and whether two of them
//! ever carried the same entity at once.

use crate::error::{SyncError, SyncResult};
use crate::store::{LocalRecord, LocalStore, RemoteStore};
use cardsync_protocol::{
    AckOutcome, BatchAck, BatchRequest, Direction, EntityKind, EntitySnapshot, OperationAck,
    OperationType, RemoteChange, SyncOperation,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

type Key = (EntityKind, String);

fn key(kind: EntityKind, id: &str) -> Key {
    (kind, id.to_string())
}

/// A local store held in a map.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    records: RwLock<HashMap<Key, LocalRecord>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an entity already reconciled with the remote at its version.
    pub fn seed(&self, snapshot: EntitySnapshot) {
        let version = snapshot.version;
        self.records.write().insert(
            key(snapshot.kind, &snapshot.id),
            LocalRecord::synced(snapshot, version),
        );
    }

    /// Applies a user edit and returns the operation that propagates it.
    ///
    /// The edit keeps the version and value the entity was last reconciled
    /// with.
    pub fn edit(&self, snapshot: EntitySnapshot) -> SyncOperation {
        let mut records = self.records.write();
        let (synced_version, base) = records
            .get(&key(snapshot.kind, &snapshot.id))
            .map_or((0, None), |record| {
                (record.synced_version, record.base.clone())
            });
        let snapshot = snapshot.with_version(synced_version);

        let op = if snapshot.deleted {
            SyncOperation::delete(snapshot.kind, snapshot.id.clone())
                .with_base_version(synced_version)
        } else if synced_version == 0 {
            SyncOperation::create(snapshot.clone())
        } else {
            SyncOperation::update(snapshot.clone())
        };
        records.insert(
            key(snapshot.kind, &snapshot.id),
            LocalRecord::edited(snapshot, synced_version).with_base(base),
        );
        op
    }

    /// Returns the record of an entity.
    pub fn record(&self, kind: EntityKind, id: &str) -> Option<LocalRecord> {
        self.records.read().get(&key(kind, id)).cloned()
    }

    /// Makes every following write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn check_writable(&self) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::LocalStore("write rejected".into()));
        }
        Ok(())
    }
}

impl LocalStore for MemoryLocalStore {
    fn get_entity(&self, kind: EntityKind, id: &str) -> SyncResult<Option<LocalRecord>> {
        Ok(self.record(kind, id))
    }

    fn put_entity(&self, snapshot: EntitySnapshot, version: u64) -> SyncResult<()> {
        self.check_writable()?;
        let snapshot = snapshot.with_version(version);
        self.records.write().insert(
            key(snapshot.kind, &snapshot.id),
            LocalRecord::synced(snapshot, version),
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn put_resolved(&self, value: EntitySnapshot, base: EntitySnapshot) -> SyncResult<()> {
        self.check_writable()?;
        let version = base.version;
        let value = value.with_version(version);
        self.records.write().insert(
            key(value.kind, &value.id),
            LocalRecord::edited(value, version).with_base(Some(base)),
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list_pending_local_edits(&self) -> SyncResult<Vec<LocalRecord>> {
        let mut pending: Vec<LocalRecord> = self
            .records
            .read()
            .values()
            .filter(|record| record.pending_edit)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.snapshot.key().cmp(&b.snapshot.key()));
        Ok(pending)
    }

    fn mark_synced(
        &self,
        kind: EntityKind,
        id: &str,
        version: u64,
        still_pending: bool,
    ) -> SyncResult<()> {
        self.check_writable()?;
        let mut records = self.records.write();
        let record = records
            .get_mut(&key(kind, id))
            .ok_or_else(|| SyncError::NotFound(format!("{kind}/{id}")))?;
        record.synced_version = version;
        record.snapshot.version = version;
        record.pending_edit = still_pending;
        // With later edits queued the pushed value is no longer at hand.
        if !still_pending {
            record.base = Some(record.snapshot.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    entities: HashMap<Key, (EntitySnapshot, u64)>,
    clock: u64,
    in_flight: HashSet<String>,
    rejections: HashMap<String, bool>,
}

impl RemoteState {
    fn store(&mut self, snapshot: EntitySnapshot) {
        self.clock += 1;
        let changed_at = self.clock;
        self.entities
            .insert(key(snapshot.kind, &snapshot.id), (snapshot, changed_at));
    }

    fn current(&self, kind: EntityKind, id: &str) -> Option<&EntitySnapshot> {
        self.entities.get(&key(kind, id)).map(|(snapshot, _)| snapshot)
    }

    fn apply(&mut self, op: &SyncOperation, direction: Direction) -> AckOutcome {
        if let Some(&retryable) = self.rejections.get(&op.entity_id) {
            return AckOutcome::Rejected {
                reason: format!("entity {} rejected", op.entity_id),
                retryable,
            };
        }

        let current = self.current(op.entity_kind, &op.entity_id).cloned();
        if direction == Direction::Pull {
            return AckOutcome::Applied {
                version: current.as_ref().map_or(0, |s| s.version),
                snapshot: current,
            };
        }

        let current_version = current.as_ref().map_or(0, |s| s.version);
        let stale = match op.op_type {
            OperationType::Create => current.as_ref().is_some_and(|s| !s.deleted),
            OperationType::Update | OperationType::Delete => current_version > op.base_version,
        };
        if stale {
            return AckOutcome::Conflict { remote: current };
        }

        let version = current_version + 1;
        let snapshot = match (&op.payload, op.op_type) {
            (_, OperationType::Delete) | (None, _) => {
                EntitySnapshot::new(op.entity_kind, op.entity_id.clone())
                    .with_version(version)
                    .tombstone()
            }
            (Some(payload), _) => {
                let mut snapshot = payload.clone().with_version(version);
                snapshot.deleted = false;
                snapshot
            }
        };
        self.store(snapshot.clone());
        AckOutcome::Applied {
            version,
            snapshot: Some(snapshot),
        }
    }
}

/// A remote store held in a map.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    state: Mutex<RemoteState>,
    latency: Mutex<Duration>,
    fail_next: AtomicU32,
    always_fail: AtomicBool,
    auth_failure: AtomicBool,
    fetch_entity_calls: AtomicUsize,
    fetch_delta_calls: AtomicUsize,
    apply_calls: AtomicUsize,
    applied_operations: AtomicUsize,
    active_batches: AtomicUsize,
    max_concurrent_batches: AtomicUsize,
    concurrency_violations: AtomicUsize,
}

impl MemoryRemoteStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a snapshot as committed by another device.
    ///
    /// A zero version is bumped to 1.
    pub fn seed(&self, snapshot: EntitySnapshot) {
        let version = snapshot.version.max(1);
        self.state.lock().store(snapshot.with_version(version));
    }

    /// Returns the stored snapshot of an entity.
    pub fn entity(&self, kind: EntityKind, id: &str) -> Option<EntitySnapshot> {
        self.state.lock().current(kind, id).cloned()
    }

    /// Delays every network call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fails the next `n` batch calls with a retryable transport error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fails every batch call with a retryable transport error.
    pub fn set_always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Rejects every call as unauthenticated.
    pub fn set_auth_failure(&self, fail: bool) {
        self.auth_failure.store(fail, Ordering::SeqCst);
    }

    /// Rejects every operation on `entity_id`.
    pub fn reject_entity(&self, entity_id: &str, retryable: bool) {
        self.state
            .lock()
            .rejections
            .insert(entity_id.to_string(), retryable);
    }

    /// Number of `fetch_entity` calls.
    pub fn fetch_entity_calls(&self) -> usize {
        self.fetch_entity_calls.load(Ordering::SeqCst)
    }

    /// Number of `fetch_delta` calls.
    pub fn fetch_delta_calls(&self) -> usize {
        self.fetch_delta_calls.load(Ordering::SeqCst)
    }

    /// Number of `apply_batch` calls, failed ones included.
    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// Push operations applied.
    pub fn applied_operations(&self) -> usize {
        self.applied_operations.load(Ordering::SeqCst)
    }

    /// Highest number of batches seen in flight at once.
    pub fn max_concurrent_batches(&self) -> usize {
        self.max_concurrent_batches.load(Ordering::SeqCst)
    }

    /// Times a batch carried an entity another batch was still carrying.
    pub fn concurrency_violations(&self) -> usize {
        self.concurrency_violations.load(Ordering::SeqCst)
    }

    fn check_auth(&self) -> SyncResult<()> {
        if self.auth_failure.load(Ordering::SeqCst) {
            return Err(SyncError::AuthenticationFailed("token rejected".into()));
        }
        Ok(())
    }

    fn latency(&self) -> Duration {
        *self.latency.lock()
    }

    fn injected_failure(&self) -> Option<SyncError> {
        if self.always_fail.load(Ordering::SeqCst) {
            return Some(SyncError::transport_retryable("connection reset"));
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| SyncError::transport_retryable("connection reset"))
    }

    fn enter(&self, request: &BatchRequest) {
        let active = self.active_batches.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_batches
            .fetch_max(active, Ordering::SeqCst);
        let mut state = self.state.lock();
        for op in &request.operations {
            if !state.in_flight.insert(op.entity_id.clone()) {
                self.concurrency_violations.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn leave(&self, request: &BatchRequest) {
        let mut state = self.state.lock();
        for op in &request.operations {
            state.in_flight.remove(&op.entity_id);
        }
        self.active_batches.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn fetch_delta(
        &self,
        since: u64,
    ) -> impl Future<Output = SyncResult<Vec<RemoteChange>>> + Send {
        async move {
            self.fetch_delta_calls.fetch_add(1, Ordering::SeqCst);
            self.check_auth()?;
            let latency = self.latency();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            let state = self.state.lock();
            let mut changes: Vec<RemoteChange> = state
                .entities
                .values()
                .filter(|(_, changed_at)| *changed_at > since)
                .map(|(snapshot, changed_at)| RemoteChange {
                    entity_kind: snapshot.kind,
                    entity_id: snapshot.id.clone(),
                    version: snapshot.version,
                    deleted: snapshot.deleted,
                    changed_at_ms: *changed_at,
                })
                .collect();
            changes.sort_by_key(|change| change.changed_at_ms);
            Ok(changes)
        }
    }

    fn fetch_entity(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> impl Future<Output = SyncResult<Option<EntitySnapshot>>> + Send {
        let id = id.to_string();
        async move {
            self.fetch_entity_calls.fetch_add(1, Ordering::SeqCst);
            self.check_auth()?;
            let latency = self.latency();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Ok(self.entity(kind, &id))
        }
    }

    fn apply_batch(
        &self,
        request: BatchRequest,
    ) -> impl Future<Output = SyncResult<BatchAck>> + Send {
        async move {
            self.apply_calls.fetch_add(1, Ordering::SeqCst);
            self.check_auth()?;
            if let Some(err) = self.injected_failure() {
                return Err(err);
            }

            self.enter(&request);
            let latency = self.latency();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            let results: Vec<OperationAck> = {
                let mut state = self.state.lock();
                request
                    .operations
                    .iter()
                    .map(|op| OperationAck::new(op.op_id, state.apply(op, request.direction)))
                    .collect()
            };
            if request.direction == Direction::Push {
                let applied = results
                    .iter()
                    .filter(|ack| matches!(ack.outcome, AckOutcome::Applied { .. }))
                    .count();
                self.applied_operations
                    .fetch_add(applied, Ordering::SeqCst);
            }
            self.leave(&request);
            Ok(BatchAck::new(request.batch_id, results))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: &str) -> EntitySnapshot {
        EntitySnapshot::new(EntityKind::Card, id).with_field("front", "A")
    }

    #[test]
    fn edit_builds_matching_operation() {
        let local = MemoryLocalStore::new();
        let op = local.edit(card("new"));
        assert_eq!(op.op_type, OperationType::Create);

        local.seed(card("c1").with_version(4));
        let op = local.edit(card("c1").with_field("front", "B"));
        assert_eq!(op.op_type, OperationType::Update);
        assert_eq!(op.base_version, 4);
        let record = local.record(EntityKind::Card, "c1").unwrap();
        assert!(record.pending_edit);
        assert_eq!(record.synced_version, 4);

        let op = local.edit(card("c1").tombstone());
        assert_eq!(op.op_type, OperationType::Delete);
    }

    #[test]
    fn edits_keep_the_last_reconciled_value() {
        let local = MemoryLocalStore::new();
        local.seed(card("c1").with_version(4));
        local.edit(card("c1").with_field("front", "B"));
        local.edit(card("c1").with_field("front", "C"));
        let record = local.record(EntityKind::Card, "c1").unwrap();
        assert_eq!(record.base.unwrap().text("front"), Some("A"));

        local.mark_synced(EntityKind::Card, "c1", 5, false).unwrap();
        let record = local.record(EntityKind::Card, "c1").unwrap();
        assert_eq!(record.base.unwrap().text("front"), Some("C"));

        let remote = card("c1").with_field("front", "R").with_version(7);
        local
            .put_resolved(card("c1").with_field("front", "M"), remote.clone())
            .unwrap();
        let record = local.record(EntityKind::Card, "c1").unwrap();
        assert!(record.pending_edit);
        assert_eq!(record.synced_version, 7);
        assert_eq!(record.snapshot.text("front"), Some("M"));
        assert_eq!(record.base, Some(remote));
    }

    #[test]
    fn failed_writes_leave_records_untouched() {
        let local = MemoryLocalStore::new();
        local.seed(card("c1").with_version(1));
        local.set_fail_writes(true);
        assert!(local.put_entity(card("c1"), 2).is_err());
        assert_eq!(
            local.record(EntityKind::Card, "c1").unwrap().synced_version,
            1
        );
    }

    #[tokio::test]
    async fn stale_update_is_a_conflict() {
        let remote = MemoryRemoteStore::new();
        remote.seed(card("c1").with_version(3));

        let op = SyncOperation::update(card("c1").with_version(2));
        let ack = remote
            .apply_batch(BatchRequest::new("d", Direction::Push, vec![op]))
            .await
            .unwrap();
        assert!(matches!(
            ack.results[0].outcome,
            AckOutcome::Conflict { remote: Some(_) }
        ));

        let op = SyncOperation::update(card("c1").with_field("front", "B").with_version(3));
        let ack = remote
            .apply_batch(BatchRequest::new("d", Direction::Push, vec![op]))
            .await
            .unwrap();
        assert!(matches!(
            ack.results[0].outcome,
            AckOutcome::Applied { version: 4, .. }
        ));
        assert_eq!(
            remote.entity(EntityKind::Card, "c1").unwrap().text("front"),
            Some("B")
        );
    }

    #[tokio::test]
    async fn delta_lists_changes_after_cursor() {
        let remote = MemoryRemoteStore::new();
        remote.seed(card("a"));
        remote.seed(card("b"));
        let all = remote.fetch_delta(0).await.unwrap();
        assert_eq!(all.len(), 2);

        let newer = remote.fetch_delta(all[0].changed_at_ms).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].entity_id, "b");
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let remote = MemoryRemoteStore::new();
        remote.fail_next(2);
        let request = || BatchRequest::new("d", Direction::Push, Vec::new());
        assert!(remote.apply_batch(request()).await.is_err());
        assert!(remote.apply_batch(request()).await.is_err());
        assert!(remote.apply_batch(request()).await.is_ok());
        assert_eq!(remote.apply_calls(), 3);
    }
}

//! The open-conflict set and the resolved-conflict archive.

use crate::clock::now_millis;
use crate::error::{SyncError, SyncResult};
use crate::journal::{Journal, JournalRecord};
use cardsync_protocol::{EntitySnapshot, Resolution, SyncConflict};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Default)]
struct ConflictState {
    open: BTreeMap<String, SyncConflict>,
    archive: Vec<SyncConflict>,
}

impl ConflictState {
    fn open_by_id(&self, id: Uuid) -> SyncResult<&SyncConflict> {
        self.open
            .values()
            .find(|c| c.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("open conflict {id}")))
    }
}

/// Whether [`ConflictSet::upsert`] created or refreshed a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new open conflict.
    Created,
    /// The pending conflict of the same entity was refreshed.
    Refreshed,
}

/// Durable set of open conflicts, one per entity id.
pub struct ConflictSet {
    journal: Journal,
    state: RwLock<ConflictState>,
}

impl ConflictSet {
    /// Loads the set from the journal.
    pub fn open(journal: Journal) -> Self {
        let snapshot = journal.state();
        Self {
            journal,
            state: RwLock::new(ConflictState {
                open: snapshot.open_conflicts,
                archive: snapshot.archived_conflicts,
            }),
        }
    }

    /// Records a detected conflict.
    ///
    /// If the entity already has an open conflict it is refreshed in place
    /// and keeps its id; the stored record is returned either way.
    pub fn upsert(&self, conflict: SyncConflict) -> SyncResult<(SyncConflict, Upsert)> {
        let mut state = self.state.write();
        let (record, upsert) = match state.open.get(&conflict.entity_id) {
            Some(existing) => {
                let mut refreshed = existing.clone();
                refreshed.refresh(conflict)?;
                (refreshed, Upsert::Refreshed)
            }
            None => (conflict, Upsert::Created),
        };

        self.journal
            .append(JournalRecord::ConflictUpserted(record.clone()))?;
        debug!(
            conflict_id = %record.id,
            entity_id = %record.entity_id,
            kind = %record.conflict_kind,
            ?upsert,
            "conflict recorded"
        );
        state
            .open
            .insert(record.entity_id.clone(), record.clone());
        Ok((record, upsert))
    }

    /// Counts a failed resolution attempt; the conflict stays open.
    pub fn record_failure(&self, id: Uuid, reason: &str) -> SyncResult<SyncConflict> {
        let mut state = self.state.write();
        let mut conflict = state.open_by_id(id)?.clone();
        conflict.record_failure(reason)?;

        self.journal
            .append(JournalRecord::ConflictUpserted(conflict.clone()))?;
        state
            .open
            .insert(conflict.entity_id.clone(), conflict.clone());
        Ok(conflict)
    }

    /// Closes an open conflict and moves it to the archive.
    pub fn close(
        &self,
        id: Uuid,
        resolution: Resolution,
        value: EntitySnapshot,
        auto_resolved: bool,
    ) -> SyncResult<SyncConflict> {
        let mut state = self.state.write();
        let mut conflict = state.open_by_id(id)?.clone();
        conflict.close(resolution, value, auto_resolved, now_millis())?;

        self.journal
            .append(JournalRecord::ConflictArchived(conflict.clone()))?;
        state.open.remove(&conflict.entity_id);
        state.archive.push(conflict.clone());
        info!(
            conflict_id = %id,
            entity_id = %conflict.entity_id,
            resolution = %resolution,
            auto_resolved,
            "conflict resolved"
        );
        Ok(conflict)
    }

    /// Returns an open conflict by id.
    pub fn get(&self, id: Uuid) -> Option<SyncConflict> {
        self.state.read().open_by_id(id).ok().cloned()
    }

    /// Returns the open conflict of an entity.
    pub fn for_entity(&self, entity_id: &str) -> Option<SyncConflict> {
        self.state.read().open.get(entity_id).cloned()
    }

    /// Returns all open conflicts.
    pub fn open_conflicts(&self) -> Vec<SyncConflict> {
        self.state.read().open.values().cloned().collect()
    }

    /// Number of open conflicts.
    pub fn open_count(&self) -> usize {
        self.state.read().open.len()
    }

    /// Returns resolved conflicts, oldest first.
    pub fn history(&self) -> Vec<SyncConflict> {
        self.state.read().archive.clone()
    }
}

impl std::fmt::Debug for ConflictSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ConflictSet")
            .field("open", &state.open.len())
            .field("archived", &state.archive.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardsync_protocol::{ConflictKind, EntityKind};
    use cardsync_storage::InMemoryBackend;

    fn conflict(entity: &str, remote_version: u64) -> SyncConflict {
        SyncConflict::new(
            EntitySnapshot::new(EntityKind::Card, entity).with_field("front", "local"),
            EntitySnapshot::new(EntityKind::Card, entity)
                .with_field("front", "remote")
                .with_version(remote_version),
            ConflictKind::Content,
            now_millis(),
        )
    }

    #[test]
    fn redetection_refreshes_instead_of_duplicating() {
        let set = ConflictSet::open(Journal::in_memory().unwrap());
        let (first, upsert) = set.upsert(conflict("c1", 3)).unwrap();
        assert_eq!(upsert, Upsert::Created);

        let (second, upsert) = set.upsert(conflict("c1", 4)).unwrap();
        assert_eq!(upsert, Upsert::Refreshed);
        assert_eq!(second.id, first.id);
        assert_eq!(second.remote_snapshot.version, 4);
        assert_eq!(set.open_count(), 1);
    }

    #[test]
    fn close_archives() {
        let set = ConflictSet::open(Journal::in_memory().unwrap());
        let (c, _) = set.upsert(conflict("c1", 3)).unwrap();

        let closed = set
            .close(c.id, Resolution::RemoteWins, c.remote_snapshot.clone(), true)
            .unwrap();
        assert_eq!(closed.resolution, Resolution::RemoteWins);
        assert!(closed.auto_resolved);
        assert_eq!(set.open_count(), 0);
        assert_eq!(set.history(), vec![closed]);

        assert!(matches!(
            set.close(c.id, Resolution::LocalWins, c.local_snapshot, false),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn failures_keep_conflict_open() {
        let set = ConflictSet::open(Journal::in_memory().unwrap());
        let (c, _) = set.upsert(conflict("c1", 3)).unwrap();

        let failed = set.record_failure(c.id, "local write failed").unwrap();
        assert_eq!(failed.retry_count, 1);
        assert_eq!(set.for_entity("c1").unwrap().retry_count, 1);
        assert!(set.get(c.id).is_some());
    }

    #[test]
    fn open_set_and_archive_survive_restart() {
        let backend = InMemoryBackend::new();
        {
            let set = ConflictSet::open(Journal::open(Box::new(backend.clone())).unwrap());
            let (a, _) = set.upsert(conflict("a", 2)).unwrap();
            set.upsert(conflict("b", 2)).unwrap();
            set.close(a.id, Resolution::LocalWins, a.local_snapshot.clone(), false)
                .unwrap();
        }

        let set = ConflictSet::open(Journal::open(Box::new(backend)).unwrap());
        assert_eq!(set.open_count(), 1);
        assert!(set.for_entity("b").is_some());
        assert_eq!(set.history().len(), 1);
        assert_eq!(set.history()[0].entity_id, "a");
    }
}

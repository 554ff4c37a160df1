//! The Conflict Detector.

use crate::backoff::call_with_retry;
use crate::clock::now_millis;
use crate::config::RetryConfig;
use crate::error::SyncResult;
use crate::store::{LocalRecord, RemoteStore};
use cardsync_protocol::{ConflictKind, EntityKind, EntitySnapshot, SyncConflict};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Classifies local state against the remote snapshot.
///
/// Only version markers are compared, never payloads. Returns `None` when
/// the local copy has no pending edit or the remote has not moved past the
/// version the local copy was last reconciled with.
pub fn classify(local: &LocalRecord, remote: Option<&EntitySnapshot>) -> Option<ConflictKind> {
    if !local.pending_edit {
        return None;
    }
    let local_deleted = local.snapshot.deleted;

    match remote {
        // Never reached the remote: a plain local create.
        None if local.synced_version == 0 => None,
        // Synced once, now gone remotely.
        None if local_deleted => None,
        None => Some(ConflictKind::DeleteVsUpdate),
        Some(remote) if remote.deleted && local_deleted => None,
        Some(remote) if remote.deleted => {
            (remote.version > local.synced_version).then_some(ConflictKind::DeleteVsUpdate)
        }
        Some(_) if local.synced_version == 0 => Some(ConflictKind::ConcurrentCreate),
        Some(remote) if remote.version > local.synced_version => Some(if local_deleted {
            ConflictKind::DeleteVsUpdate
        } else {
            ConflictKind::Content
        }),
        Some(_) => None,
    }
}

/// Builds the conflict record for a classified divergence.
pub fn check(local: &LocalRecord, remote: Option<EntitySnapshot>) -> Option<SyncConflict> {
    let kind = classify(local, remote.as_ref())?;
    let remote = remote.unwrap_or_else(|| {
        EntitySnapshot::new(local.snapshot.kind, local.snapshot.id.clone())
            .with_version(local.synced_version)
            .tombstone()
    });
    Some(
        SyncConflict::new(local.snapshot.clone(), remote, kind, now_millis())
            .with_base(local.base.clone()),
    )
}

/// Compares local entities with their authoritative remote snapshots.
pub struct ConflictDetector<R> {
    remote: Arc<R>,
    retry: RetryConfig,
    timeout: Duration,
}

impl<R: RemoteStore> ConflictDetector<R> {
    /// Creates a detector that looks snapshots up through `remote`.
    pub fn new(remote: Arc<R>, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            remote,
            retry,
            timeout,
        }
    }

    /// Detects divergence for one entity.
    ///
    /// Entities without a pending edit return `None` without a network call.
    pub async fn detect(
        &self,
        kind: EntityKind,
        id: &str,
        local: &LocalRecord,
    ) -> SyncResult<Option<SyncConflict>> {
        if !local.pending_edit {
            return Ok(None);
        }

        let remote = call_with_retry(&self.retry, self.timeout, "fetch_entity", || {
            self.remote.fetch_entity(kind, id)
        })
        .await?;

        let conflict = check(local, remote);
        if let Some(conflict) = &conflict {
            debug!(
                entity_id = id,
                kind = %conflict.conflict_kind,
                local_version = local.synced_version,
                remote_version = conflict.remote_snapshot.version,
                "divergence detected"
            );
        }
        Ok(conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemoteStore;

    fn card(version: u64) -> EntitySnapshot {
        EntitySnapshot::new(EntityKind::Card, "c1")
            .with_field("front", "A")
            .with_version(version)
    }

    #[test]
    fn no_pending_edit_never_conflicts() {
        let local = LocalRecord::synced(card(2), 2);
        assert_eq!(classify(&local, Some(&card(9))), None);
    }

    #[test]
    fn same_version_does_not_conflict() {
        let local = LocalRecord::edited(card(2).with_field("front", "B"), 2);
        assert_eq!(classify(&local, Some(&card(2))), None);
    }

    #[test]
    fn newer_remote_is_content_conflict() {
        let local = LocalRecord::edited(card(2).with_field("front", "B"), 2);
        assert_eq!(
            classify(&local, Some(&card(3))),
            Some(ConflictKind::Content)
        );
    }

    #[test]
    fn remote_delete_against_local_update() {
        let local = LocalRecord::edited(card(2).with_field("front", "B"), 2);
        assert_eq!(
            classify(&local, Some(&card(3).tombstone())),
            Some(ConflictKind::DeleteVsUpdate)
        );
        assert_eq!(classify(&local, None), Some(ConflictKind::DeleteVsUpdate));

        let local_delete = LocalRecord::edited(card(2).tombstone(), 2);
        assert_eq!(
            classify(&local_delete, Some(&card(3))),
            Some(ConflictKind::DeleteVsUpdate)
        );
        assert_eq!(classify(&local_delete, Some(&card(3).tombstone())), None);
    }

    #[test]
    fn independent_creates_with_same_id() {
        let local = LocalRecord::edited(card(0), 0);
        assert_eq!(
            classify(&local, Some(&card(1))),
            Some(ConflictKind::ConcurrentCreate)
        );
        assert_eq!(classify(&local, None), None);
    }

    #[test]
    fn check_builds_tombstone_for_missing_remote() {
        let local = LocalRecord::edited(card(4).with_field("front", "B"), 4);
        let conflict = check(&local, None).unwrap();
        assert!(conflict.remote_snapshot.deleted);
        assert_eq!(conflict.remote_snapshot.version, 4);
        assert_eq!(conflict.conflict_kind, ConflictKind::DeleteVsUpdate);
    }

    #[test]
    fn check_carries_the_last_reconciled_value() {
        let base = card(2).with_field("front", "A");
        let local = LocalRecord::edited(card(2).with_field("front", "B"), 2)
            .with_base(Some(base.clone()));
        let conflict = check(&local, Some(card(3).with_field("front", "R"))).unwrap();
        assert_eq!(conflict.base_snapshot, Some(base));
    }

    #[tokio::test]
    async fn detect_fetches_remote_only_for_pending_edits() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.seed(card(3).with_field("front", "Remote"));
        let detector = ConflictDetector::new(
            remote.clone(),
            RetryConfig::no_retry(),
            Duration::from_secs(1),
        );

        let clean = LocalRecord::synced(card(2), 2);
        assert!(detector
            .detect(EntityKind::Card, "c1", &clean)
            .await
            .unwrap()
            .is_none());
        assert_eq!(remote.fetch_entity_calls(), 0);

        let edited = LocalRecord::edited(card(2).with_field("front", "B"), 2);
        let conflict = detector
            .detect(EntityKind::Card, "c1", &edited)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conflict.conflict_kind, ConflictKind::Content);
        assert_eq!(conflict.remote_snapshot.text("front"), Some("Remote"));
        assert_eq!(remote.fetch_entity_calls(), 1);
    }
}

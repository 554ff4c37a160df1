//! The Sync Orchestrator.
//!
//! A session runs `idle → analyzing → ready → running` and ends `completed`,
//! `paused` or `failed`. Analysis fetches the remote delta and estimates
//! the work. Running first pulls remote changes (routing entities with
//! local edits through the conflict detector), then drains the operation
//! log through the batch transfer engine in scheduler rounds until the
//! queue is empty, the session is paused, or the network drops below the
//! configured floor.
//!
//! Only one session may be active at a time. Conflict handling for an
//! entity runs under that entity's async lock, so detection, resolution
//! and the local write never interleave with another resolution of the
//! same entity.

use crate::backoff::call_with_retry;
use crate::clock::now_millis;
use crate::config::SyncConfig;
use crate::conflicts::{ConflictSet, Upsert};
use crate::detector::{self, ConflictDetector};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, EventSubscription, SyncEvent};
use crate::journal::{CompactionStats, Journal, JournalRecord, SyncCheckpoint};
use crate::metrics::{MetricsRecorder, SyncMetrics};
use crate::network::{NetworkMonitor, NetworkStatus, TransferParams};
use crate::oplog::OperationLog;
use crate::resolver;
use crate::session::{SessionState, SyncMode, SyncSession};
use crate::store::{BackupHook, CacheInvalidator, LocalRecord, LocalStore, RemoteStore};
use crate::transfer::{BatchTransferEngine, ConflictedOperation};
use cardsync_protocol::{
    ConflictKind, Direction, EntityKind, EntitySnapshot, OperationType, ProtocolError, RemoteChange,
    Resolution, SyncConflict, SyncOperation,
};
use cardsync_storage::StorageBackend;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How a drain loop ended.
enum PassEnd {
    Drained,
    Paused(String),
}

/// Entities the pull phase has to look at.
#[derive(Default)]
struct PullPlan {
    /// Entities without local edits: fetch and overwrite.
    lookups: Vec<(EntityKind, String)>,
    /// Entities with local edits the remote moved past: check for conflicts.
    reconcile: Vec<(EntityKind, String)>,
}

impl PullPlan {
    fn len(&self) -> usize {
        self.lookups.len() + self.reconcile.len()
    }
}

struct ActiveSlot<'a>(&'a AtomicBool);

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct EngineInner<L, R> {
    config: SyncConfig,
    journal: Journal,
    log: Arc<OperationLog>,
    conflicts: ConflictSet,
    local: Arc<L>,
    remote: Arc<R>,
    detector: ConflictDetector<R>,
    transfer: BatchTransferEngine<R>,
    network: NetworkMonitor,
    events: EventBus,
    metrics: MetricsRecorder,
    cache: RwLock<Option<Arc<dyn CacheInvalidator>>>,
    backup: RwLock<Option<Arc<dyn BackupHook>>>,
    active: AtomicBool,
    paused: Arc<AtomicBool>,
    wake: Notify,
    entity_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    session: RwLock<Option<SyncSession>>,
}

/// The sync engine.
///
/// Cheap to clone; clones share one engine.
pub struct SyncEngine<L, R> {
    inner: Arc<EngineInner<L, R>>,
}

impl<L, R> Clone for SyncEngine<L, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: LocalStore + 'static, R: RemoteStore> SyncEngine<L, R> {
    /// Creates an engine over an opened journal.
    pub fn new(config: SyncConfig, journal: Journal, local: Arc<L>, remote: Arc<R>) -> Self {
        let log = Arc::new(OperationLog::open(
            journal.clone(),
            config.max_retries,
            config.retry.clone(),
        ));
        let conflicts = ConflictSet::open(journal.clone());
        let paused = Arc::new(AtomicBool::new(false));
        let detector =
            ConflictDetector::new(remote.clone(), config.retry.clone(), config.request_timeout);
        let transfer = BatchTransferEngine::new(remote.clone(), log.clone(), &config)
            .with_stop_signal(paused.clone());
        let events = EventBus::new(config.progress_buffer);
        let metrics = MetricsRecorder::new(config.metrics_window);

        info!(
            device_id = %config.device_id,
            pending = log.pending_count(),
            open_conflicts = conflicts.open_count(),
            "sync engine ready"
        );

        Self {
            inner: Arc::new(EngineInner {
                config,
                journal,
                log,
                conflicts,
                local,
                remote,
                detector,
                transfer,
                network: NetworkMonitor::default(),
                events,
                metrics,
                cache: RwLock::new(None),
                backup: RwLock::new(None),
                active: AtomicBool::new(false),
                paused,
                wake: Notify::new(),
                entity_locks: Mutex::new(HashMap::new()),
                session: RwLock::new(None),
            }),
        }
    }

    /// Opens the journal on `backend` and creates an engine over it.
    pub fn open(
        config: SyncConfig,
        backend: Box<dyn StorageBackend>,
        local: Arc<L>,
        remote: Arc<R>,
    ) -> SyncResult<Self> {
        Ok(Self::new(config, Journal::open(backend)?, local, remote))
    }

    /// Sets the read cache told about every entity the engine writes.
    pub fn with_cache_invalidator(self, cache: Arc<dyn CacheInvalidator>) -> Self {
        *self.inner.cache.write() = Some(cache);
        self
    }

    /// Sets the hook that takes and restores backups around sessions.
    pub fn with_backup_hook(self, hook: Arc<dyn BackupHook>) -> Self {
        *self.inner.backup.write() = Some(hook);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Queues a local mutation. Durable when this returns.
    pub fn enqueue(&self, op: SyncOperation) -> SyncResult<u64> {
        let op_id = self.inner.log.enqueue(op)?;
        self.inner.wake.notify_one();
        Ok(op_id)
    }

    /// The network adapter; feed connectivity reports here.
    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    /// Shorthand for `network().report(status)`.
    pub fn report_network(&self, status: NetworkStatus) {
        self.inner.network.report(status);
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    /// Returns the current metrics.
    pub fn metrics(&self) -> SyncMetrics {
        self.inner.metrics.snapshot()
    }

    /// Zeroes the metrics.
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
        info!("sync metrics reset");
    }

    /// Returns true while a session holds the active slot.
    pub fn is_syncing(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Returns the most recent session.
    pub fn session(&self) -> Option<SyncSession> {
        self.inner.session.read().clone()
    }

    /// Queued and in-flight operations in drain order.
    pub fn pending_operations(&self) -> Vec<SyncOperation> {
        self.inner.log.pending()
    }

    /// The dead-letter set.
    pub fn dead_letters(&self) -> Vec<SyncOperation> {
        self.inner.log.dead_letters()
    }

    /// Puts a dead letter back in the queue with a fresh retry budget.
    pub fn requeue_dead_letter(&self, op_id: u64) -> SyncResult<()> {
        self.inner.log.requeue_dead_letter(op_id)?;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Open conflicts.
    pub fn open_conflicts(&self) -> Vec<SyncConflict> {
        self.inner.conflicts.open_conflicts()
    }

    /// Resolved conflicts, oldest first.
    pub fn conflict_history(&self) -> Vec<SyncConflict> {
        self.inner.conflicts.history()
    }

    /// Persisted sync timestamps and delta cursor.
    pub fn checkpoint(&self) -> SyncCheckpoint {
        self.inner.journal.checkpoint()
    }

    /// Rewrites the journal without superseded records.
    pub fn compact(&self) -> SyncResult<CompactionStats> {
        self.inner.journal.compact()
    }

    /// Runs a sync session, incremental unless a full one is due.
    ///
    /// Returns the session in its final state. A session refused because
    /// the network cannot sync comes back `failed` with the reason
    /// `network-unavailable`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AlreadyInProgress`] while another session is
    /// active; that session is not affected.
    pub async fn sync(&self) -> SyncResult<SyncSession> {
        self.start(false).await
    }

    /// Runs a full sync session regardless of the checkpoint.
    pub async fn full_sync(&self) -> SyncResult<SyncSession> {
        self.start(true).await
    }

    /// Asks the running session to pause.
    ///
    /// Batches already sent finish; no new batch is admitted.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        info!("sync pause requested");
    }

    /// Resumes the most recent session if it is paused.
    ///
    /// The session re-enters `ready` and drains whatever the operation log
    /// holds now.
    pub async fn resume(&self) -> SyncResult<SyncSession> {
        let _slot = self.claim_slot()?;
        let mut session = match self.session() {
            Some(session) if session.state == SessionState::Paused => session,
            other => {
                return Err(SyncError::InvalidStateTransition {
                    from: other.map_or("idle", |s| s.state.as_str()).to_string(),
                    to: SessionState::Ready.to_string(),
                })
            }
        };
        if !self
            .inner
            .network
            .current()
            .can_sync(self.inner.config.quality_floor)
        {
            return Err(SyncError::NetworkUnavailable);
        }

        self.inner.paused.store(false, Ordering::SeqCst);
        session.finished_at_ms = None;
        let span = info_span!(
            "sync_session",
            session_id = %session.id,
            mode = %session.mode,
            resumed = true
        );
        Ok(self.run(session, true).instrument(span).await)
    }

    /// Restores the backup of the most recent session, which must have failed.
    pub fn rollback(&self) -> SyncResult<SyncSession> {
        let mut session = match self.session() {
            Some(session) if session.state == SessionState::Failed => session,
            other => {
                return Err(SyncError::InvalidStateTransition {
                    from: other.map_or("idle", |s| s.state.as_str()).to_string(),
                    to: SessionState::RolledBack.to_string(),
                })
            }
        };
        let hook = self.inner.backup.read().clone();
        let Some(hook) = hook.filter(|_| session.backup_taken) else {
            return Err(SyncError::InvalidStateTransition {
                from: "failed without backup".into(),
                to: SessionState::RolledBack.to_string(),
            });
        };

        hook.restore_backup(session.id)?;
        self.set_state(&mut session, SessionState::RolledBack)?;
        info!(session_id = %session.id, "session rolled back");
        self.inner.events.publish(SyncEvent::SessionRolledBack {
            session_id: session.id,
        });
        Ok(session)
    }

    /// Resolves an open conflict with a user-chosen value.
    ///
    /// The value is written locally and propagated if it differs from the
    /// remote snapshot.
    pub async fn submit_resolution(
        &self,
        conflict_id: Uuid,
        value: EntitySnapshot,
    ) -> SyncResult<()> {
        let conflict = self.open_conflict(conflict_id)?;
        if value.kind != conflict.entity_kind || value.id != conflict.entity_id {
            return Err(ProtocolError::PayloadMismatch {
                op_id: 0,
                expected: conflict.entity_key(),
                found: value.key(),
            }
            .into());
        }

        let lock = self.entity_lock(&conflict.entity_id);
        let _guard = lock.lock().await;
        // Another resolution may have closed it while we waited.
        let conflict = self.open_conflict(conflict_id)?;
        self.apply_resolution(&conflict, Resolution::Manual, value, false)
    }

    /// Resolves an open conflict by picking a side or merging.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        resolution: Resolution,
    ) -> SyncResult<()> {
        let conflict = self.open_conflict(conflict_id)?;
        let lock = self.entity_lock(&conflict.entity_id);
        let _guard = lock.lock().await;
        let conflict = self.open_conflict(conflict_id)?;

        let value = resolver::value_for(&conflict, resolution).ok_or_else(|| {
            SyncError::ConflictUnresolved {
                entity_id: conflict.entity_id.clone(),
            }
        })?;
        self.apply_resolution(&conflict, resolution, value, false)
    }

    fn open_conflict(&self, conflict_id: Uuid) -> SyncResult<SyncConflict> {
        self.inner
            .conflicts
            .get(conflict_id)
            .ok_or_else(|| SyncError::NotFound(format!("open conflict {conflict_id}")))
    }

    fn claim_slot(&self) -> SyncResult<ActiveSlot<'_>> {
        if self
            .inner
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let session_id = self.session().map_or(Uuid::nil(), |s| s.id);
            return Err(SyncError::AlreadyInProgress { session_id });
        }
        Ok(ActiveSlot(&self.inner.active))
    }

    fn choose_mode(&self, force_full: bool) -> SyncMode {
        if force_full {
            return SyncMode::Full;
        }
        let staleness = u64::try_from(self.inner.config.staleness_threshold.as_millis())
            .unwrap_or(u64::MAX);
        match self.inner.journal.checkpoint().last_successful_sync_ms() {
            None => SyncMode::Full,
            Some(last) if now_millis().saturating_sub(last) > staleness => SyncMode::Full,
            Some(_) => SyncMode::Incremental,
        }
    }

    async fn start(&self, force_full: bool) -> SyncResult<SyncSession> {
        let inner = &self.inner;
        let _slot = self.claim_slot()?;
        let mode = self.choose_mode(force_full);
        let mut session = SyncSession::new(mode, now_millis());

        let status = inner.network.current();
        if !status.can_sync(inner.config.quality_floor) {
            session.transition(SessionState::Failed)?;
            session.push_error("network-unavailable");
            session.finished_at_ms = Some(session.started_at_ms);
            warn!(
                session_id = %session.id,
                online = status.online,
                quality = %status.quality,
                "sync refused: network unavailable"
            );
            inner.events.publish(SyncEvent::SessionFailed {
                session_id: session.id,
                reason: "network-unavailable".into(),
            });
            return Ok(session);
        }

        inner.paused.store(false, Ordering::SeqCst);
        *inner.session.write() = Some(session.clone());
        let span = info_span!("sync_session", session_id = %session.id, mode = %mode);
        Ok(self.run(session, false).instrument(span).await)
    }

    async fn run(&self, mut session: SyncSession, resumed: bool) -> SyncSession {
        let outcome = if resumed {
            self.resume_pass(&mut session).await
        } else {
            self.pass(&mut session).await
        };
        let finished = match outcome {
            Ok(end) => self.finish(&mut session, end).await,
            Err(err) => Err(err),
        };
        if let Err(err) = finished {
            self.fail(&mut session, err.to_string());
        }

        *self.inner.session.write() = Some(session.clone());
        self.inner
            .events
            .publish(SyncEvent::Metrics(self.inner.metrics.snapshot()));
        session
    }

    async fn pass(&self, session: &mut SyncSession) -> SyncResult<PassEnd> {
        let inner = &self.inner;
        self.set_state(session, SessionState::Analyzing)?;
        inner.events.publish(SyncEvent::SessionStarted {
            session_id: session.id,
            mode: session.mode,
        });
        info!(
            pending = inner.log.pending_count(),
            open_conflicts = inner.conflicts.open_count(),
            "sync session started"
        );

        if inner.config.backup_before_sync {
            let hook = inner.backup.read().clone();
            if let Some(hook) = hook {
                hook.create_backup(session.id)?;
                session.backup_taken = true;
                debug!("backup taken");
            }
        }

        let since = match session.mode {
            SyncMode::Full => 0,
            SyncMode::Incremental => inner.journal.checkpoint().remote_cursor,
        };
        let delta = call_with_retry(
            &inner.config.retry,
            inner.config.request_timeout,
            "fetch_delta",
            || inner.remote.fetch_delta(since),
        )
        .await?;
        let plan = self.plan_pull(&delta)?;
        session.total_ops = inner.log.pending_count() + plan.len();
        debug!(
            since,
            changes = delta.len(),
            lookups = plan.lookups.len(),
            reconcile = plan.reconcile.len(),
            estimated = session.total_ops,
            "analysis finished"
        );

        if inner.paused.load(Ordering::SeqCst) {
            return Ok(PassEnd::Paused("paused".into()));
        }
        self.set_state(session, SessionState::Ready)?;
        self.set_state(session, SessionState::Running)?;

        self.pull(session, plan, &delta).await?;
        self.drain(session).await
    }

    async fn resume_pass(&self, session: &mut SyncSession) -> SyncResult<PassEnd> {
        self.set_state(session, SessionState::Ready)?;
        session.total_ops = session.completed_ops + self.inner.log.pending_count();
        self.set_state(session, SessionState::Running)?;
        info!(pending = self.inner.log.pending_count(), "sync session resumed");
        self.drain(session).await
    }

    fn plan_pull(&self, delta: &[RemoteChange]) -> SyncResult<PullPlan> {
        let mut plan = PullPlan::default();
        let mut seen = HashSet::new();
        for change in delta {
            if !seen.insert(change.entity_key()) {
                continue;
            }
            let entry = (change.entity_kind, change.entity_id.clone());
            match self
                .inner
                .local
                .get_entity(change.entity_kind, &change.entity_id)?
            {
                // Nothing new for us.
                Some(record) if record.synced_version >= change.version => {}
                Some(record) if record.pending_edit => plan.reconcile.push(entry),
                None if change.deleted => {}
                _ => plan.lookups.push(entry),
            }
        }
        Ok(plan)
    }

    async fn pull(
        &self,
        session: &mut SyncSession,
        plan: PullPlan,
        delta: &[RemoteChange],
    ) -> SyncResult<()> {
        let inner = &self.inner;
        let mut complete = true;
        let mut reconciled = HashSet::new();

        for (kind, id) in &plan.reconcile {
            self.reconcile_entity(session, *kind, id).await?;
            reconciled.insert(id.clone());
        }
        session.advance(plan.reconcile.len(), 0, now_millis());

        if !plan.lookups.is_empty() {
            let lookups: Vec<SyncOperation> = plan
                .lookups
                .into_iter()
                .enumerate()
                .map(|(i, (kind, id))| {
                    let mut op = SyncOperation::new(OperationType::Update, kind, id, None);
                    op.op_id = i as u64 + 1;
                    op
                })
                .collect();
            let params = self.transfer_params();
            let result = inner
                .transfer
                .transfer(lookups, Direction::Pull, params)
                .await?;
            inner.metrics.record_bytes(result.bytes_sent);
            if let Some(err) = result.fatal {
                return Err(err);
            }

            for failed in &result.failed {
                session.push_error(format!("pull {}: {}", failed.op.entity_key(), failed.reason));
            }
            complete &= result.failed.is_empty()
                && result.dead_lettered.is_empty()
                && result.released.is_empty();

            let mut pulled = 0;
            for delivered in result.succeeded {
                let Some(snapshot) = delivered.snapshot else {
                    continue;
                };
                let (kind, id) = (snapshot.kind, snapshot.id.clone());
                // The user may have edited it since analysis.
                if inner
                    .local
                    .get_entity(kind, &id)?
                    .is_some_and(|record| record.pending_edit)
                {
                    continue;
                }
                inner.local.put_entity(snapshot, delivered.version)?;
                self.invalidate(kind, &id);
                pulled += 1;
            }
            session.advance(pulled, result.bytes_sent, now_millis());
            debug!(pulled, "remote changes applied locally");
        }

        if session.mode == SyncMode::Full {
            self.requeue_orphan_edits(session, &reconciled).await?;
        }

        let cursor = delta.iter().map(|c| c.changed_at_ms).max().unwrap_or(0);
        let mut checkpoint = inner.journal.checkpoint();
        if complete && cursor > checkpoint.remote_cursor {
            checkpoint.remote_cursor = cursor;
            inner.journal.append(JournalRecord::Checkpoint(checkpoint))?;
            debug!(cursor, "delta cursor advanced");
        }
        Ok(())
    }

    /// Re-enqueues local edits that have neither a queued operation nor an
    /// open conflict, after checking them against the remote.
    async fn requeue_orphan_edits(
        &self,
        session: &mut SyncSession,
        reconciled: &HashSet<String>,
    ) -> SyncResult<()> {
        let inner = &self.inner;
        for record in inner.local.list_pending_local_edits()? {
            let (kind, id) = (record.snapshot.kind, record.snapshot.id.clone());
            if reconciled.contains(&id)
                || inner.log.has_pending_for(&id)
                || inner.conflicts.for_entity(&id).is_some()
            {
                continue;
            }
            if self.reconcile_entity(session, kind, &id).await? {
                continue;
            }
            let op_id = inner.log.enqueue(operation_for(&record))?;
            session.total_ops += 1;
            info!(op_id, entity_id = %id, "orphaned local edit re-enqueued");
        }
        Ok(())
    }

    async fn drain(&self, session: &mut SyncSession) -> SyncResult<PassEnd> {
        let inner = &self.inner;
        let mut network = inner.network.subscribe();

        loop {
            if inner.paused.load(Ordering::SeqCst) {
                return Ok(PassEnd::Paused("paused".into()));
            }
            let status = inner.network.current();
            if !status.can_sync(inner.config.quality_floor) {
                return Ok(PassEnd::Paused(if status.online {
                    format!("network quality {} below floor", status.quality)
                } else {
                    "network offline".into()
                }));
            }

            let params = TransferParams::for_quality(status.quality, &inner.config);
            let mut batch = inner.log.dequeue_batch(params.round_size())?;
            if batch.is_empty() {
                if inner.log.pending_count() == 0 {
                    return Ok(PassEnd::Drained);
                }
                let Some(at) = inner.log.next_eligible_at() else {
                    return Ok(PassEnd::Drained);
                };
                let wait = Duration::from_millis(at.saturating_sub(now_millis()));
                if !wait.is_zero() {
                    debug!(wait_ms = wait.as_millis() as u64, "waiting for retry backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = inner.wake.notified() => {}
                        _ = network.changed() => {}
                    }
                }
                continue;
            }

            // Send against the version the local copy was last reconciled with.
            for op in &mut batch {
                if let Some(record) = inner.local.get_entity(op.entity_kind, &op.entity_id)? {
                    op.base_version = record.synced_version;
                }
            }

            let result = inner
                .transfer
                .transfer(batch, Direction::Push, params)
                .await?;
            inner.metrics.record_bytes(result.bytes_sent);
            let settled = result.settled();

            for delivered in &result.succeeded {
                let op = &delivered.op;
                inner.log.mark_completed(op.op_id)?;
                let still_pending = inner.log.has_pending_for(&op.entity_id);
                if let Err(err) = inner.local.mark_synced(
                    op.entity_kind,
                    &op.entity_id,
                    delivered.version,
                    still_pending,
                ) {
                    warn!(op_id = op.op_id, error = %err, "could not record synced version");
                    session.push_error(format!("{}: {err}", op.entity_key()));
                }
            }
            inner.metrics.record_succeeded(result.succeeded.len() as u64);
            inner.metrics.record_failed(result.failed.len() as u64);
            inner
                .metrics
                .record_dead_lettered(result.dead_lettered.len() as u64);

            for dead in &result.dead_lettered {
                session.push_error(format!(
                    "operation {} on {} dead-lettered: {}",
                    dead.op.op_id,
                    dead.op.entity_key(),
                    dead.reason
                ));
                inner.events.publish(SyncEvent::DeadLettered {
                    op_id: dead.op.op_id,
                    entity_id: dead.op.entity_id.clone(),
                    reason: dead.reason.clone(),
                });
            }

            for conflicted in result.conflicts {
                self.reconcile_rejected(session, conflicted).await?;
            }

            session.advance(settled, result.bytes_sent, now_millis());
            *inner.session.write() = Some(session.clone());
            inner.events.publish(SyncEvent::Progress {
                session_id: session.id,
                progress: session.progress,
                completed: session.completed_ops,
                total: session.total_ops,
            });

            // Ops lost with a failed task, or held back by a fatal error.
            inner.log.release_in_flight()?;
            if let Some(err) = result.fatal {
                return Err(err);
            }
        }
    }

    async fn finish(&self, session: &mut SyncSession, end: PassEnd) -> SyncResult<()> {
        let inner = &self.inner;
        self.retry_resolutions(session).await?;

        let open = inner.conflicts.open_count();
        let threshold = inner.config.manual_conflict_threshold;
        if open > threshold {
            return Err(SyncError::ConflictUnresolved {
                entity_id: format!("{open} open conflicts exceed threshold {threshold}"),
            });
        }

        let reason = match end {
            PassEnd::Paused(reason) => Some(reason),
            PassEnd::Drained if open > 0 => Some(format!("{open} conflicts awaiting resolution")),
            PassEnd::Drained if inner.log.pending_count() > 0 => {
                Some("operations still queued".into())
            }
            PassEnd::Drained => None,
        };

        let now = now_millis();
        session.finished_at_ms = Some(now);
        match reason {
            Some(reason) => {
                self.set_state(session, SessionState::Paused)?;
                info!(reason = %reason, pending = inner.log.pending_count(), "sync session paused");
                inner.events.publish(SyncEvent::SessionPaused {
                    session_id: session.id,
                    reason,
                });
            }
            None => {
                let mut checkpoint = inner.journal.checkpoint();
                match session.mode {
                    SyncMode::Full => checkpoint.last_full_sync_ms = Some(now),
                    SyncMode::Incremental => checkpoint.last_incremental_sync_ms = Some(now),
                }
                inner.journal.append(JournalRecord::Checkpoint(checkpoint))?;

                self.set_state(session, SessionState::Completed)?;
                session.progress = 100;
                let duration_ms = session.duration_ms(now);
                inner.metrics.record_session(duration_ms, true);
                info!(
                    operations = session.completed_ops,
                    duration_ms,
                    bytes = session.bytes_transferred,
                    "sync session completed"
                );
                inner.events.publish(SyncEvent::SessionCompleted {
                    session_id: session.id,
                    operations: session.completed_ops,
                    duration_ms,
                });
            }
        }
        Ok(())
    }

    fn fail(&self, session: &mut SyncSession, reason: String) {
        let inner = &self.inner;
        session.push_error(reason.clone());
        if let Err(err) = self.set_state(session, SessionState::Failed) {
            warn!(error = %err, "could not mark session failed");
        }
        let now = now_millis();
        session.finished_at_ms = Some(now);
        inner
            .metrics
            .record_session(session.duration_ms(now), false);
        if let Err(err) = inner.log.release_in_flight() {
            warn!(error = %err, "could not release in-flight operations");
        }
        error!(reason = %reason, "sync session failed");
        inner.events.publish(SyncEvent::SessionFailed {
            session_id: session.id,
            reason,
        });
    }

    fn set_state(&self, session: &mut SyncSession, to: SessionState) -> SyncResult<()> {
        let from = session.transition(to)?;
        debug!(session_id = %session.id, %from, %to, "session state changed");
        *self.inner.session.write() = Some(session.clone());
        self.inner.events.publish(SyncEvent::StateChanged {
            session_id: session.id,
            from,
            to,
        });
        Ok(())
    }

    fn transfer_params(&self) -> TransferParams {
        TransferParams::for_quality(self.inner.network.current().quality, &self.inner.config)
    }

    fn entity_lock(&self, entity_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.entity_locks.lock();
        // Drop locks nobody holds.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(entity_id.to_string()).or_default().clone()
    }

    fn invalidate(&self, kind: EntityKind, id: &str) {
        let cache = self.inner.cache.read().clone();
        if let Some(cache) = cache {
            cache.invalidate(kind, id);
        }
    }

    /// Runs the detector for an entity with a local edit. Returns true if a
    /// conflict was raised.
    async fn reconcile_entity(
        &self,
        session: &mut SyncSession,
        kind: EntityKind,
        id: &str,
    ) -> SyncResult<bool> {
        let lock = self.entity_lock(id);
        let _guard = lock.lock().await;

        let Some(record) = self.inner.local.get_entity(kind, id)? else {
            return Ok(false);
        };
        match self.inner.detector.detect(kind, id, &record).await {
            Ok(Some(conflict)) => {
                self.handle_conflict(session, conflict)?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(entity_id = id, error = %err, "remote lookup failed");
                session.push_error(format!("lookup {kind}/{id}: {err}"));
                Ok(false)
            }
        }
    }

    /// Handles an operation the remote refused as stale.
    async fn reconcile_rejected(
        &self,
        session: &mut SyncSession,
        conflicted: ConflictedOperation,
    ) -> SyncResult<()> {
        let ConflictedOperation { op, remote } = conflicted;
        let lock = self.entity_lock(&op.entity_id);
        let _guard = lock.lock().await;

        let mut record = match self.inner.local.get_entity(op.entity_kind, &op.entity_id)? {
            Some(record) => record,
            None => LocalRecord::edited(
                op.payload.clone().unwrap_or_else(|| {
                    EntitySnapshot::new(op.entity_kind, op.entity_id.clone()).tombstone()
                }),
                op.base_version,
            ),
        };
        record.pending_edit = true;

        let conflict = match remote {
            Some(remote) => Some(detector::check(&record, Some(remote.clone())).unwrap_or_else(
                || {
                    SyncConflict::new(
                        record.snapshot.clone(),
                        remote,
                        ConflictKind::Content,
                        now_millis(),
                    )
                    .with_base(record.base.clone())
                },
            )),
            None => match self
                .inner
                .detector
                .detect(op.entity_kind, &op.entity_id, &record)
                .await
            {
                Ok(conflict) => conflict,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    session.push_error(format!("lookup {}: {err}", op.entity_key()));
                    None
                }
            },
        };

        match conflict {
            Some(conflict) => {
                self.inner.log.remove(op.op_id)?;
                self.handle_conflict(session, conflict)
            }
            None => {
                // Counts against the retry budget so a confused remote
                // cannot keep the operation bouncing.
                self.inner
                    .log
                    .mark_failed(op.op_id, "remote conflict could not be confirmed")?;
                Ok(())
            }
        }
    }

    /// Records a conflict and applies the configured policy. Runs under the
    /// entity's lock.
    fn handle_conflict(&self, session: &mut SyncSession, conflict: SyncConflict) -> SyncResult<()> {
        let inner = &self.inner;
        let (conflict, upsert) = inner.conflicts.upsert(conflict)?;
        if upsert == Upsert::Created {
            inner.metrics.record_conflict_detected();
            info!(
                conflict_id = %conflict.id,
                entity_id = %conflict.entity_id,
                kind = %conflict.conflict_kind,
                "conflict detected"
            );
            inner.events.publish(SyncEvent::ConflictDetected {
                conflict_id: conflict.id,
                entity_id: conflict.entity_id.clone(),
                kind: conflict.conflict_kind,
            });
        }
        // The conflict carries the local edit; a queued push would only bounce.
        let held = inner.log.discard_pending_for(&conflict.entity_id)?;
        if held > 0 {
            debug!(entity_id = %conflict.entity_id, held, "queued operations folded into conflict");
        }

        if conflict.retry_count >= inner.config.resolution_max_attempts {
            return Ok(());
        }
        self.auto_resolve(session, conflict)
    }

    fn auto_resolve(&self, session: &mut SyncSession, conflict: SyncConflict) -> SyncResult<()> {
        let resolved = resolver::resolve(&conflict, self.inner.config.conflict_policy);
        let Some(value) = resolved.value else {
            self.inner.events.publish(SyncEvent::ManualConflict {
                conflict: Box::new(conflict),
            });
            return Ok(());
        };

        match self.apply_resolution(&conflict, resolved.resolution, value, true) {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                session.push_error(format!("resolve {}: {err}", conflict.entity_key()));
                Ok(())
            }
        }
    }

    /// Gives conflicts whose automatic resolution failed another attempt.
    async fn retry_resolutions(&self, session: &mut SyncSession) -> SyncResult<()> {
        let inner = &self.inner;
        if !inner.config.conflict_policy.auto_resolves() {
            return Ok(());
        }
        for conflict in inner.conflicts.open_conflicts() {
            if conflict.retry_count == 0
                || conflict.retry_count >= inner.config.resolution_max_attempts
            {
                continue;
            }
            let lock = self.entity_lock(&conflict.entity_id);
            let _guard = lock.lock().await;
            let Some(conflict) = inner.conflicts.get(conflict.id) else {
                continue;
            };
            debug!(
                conflict_id = %conflict.id,
                retry_count = conflict.retry_count,
                "retrying conflict resolution"
            );
            self.auto_resolve(session, conflict)?;
        }
        Ok(())
    }

    /// Writes a resolved value locally, propagates it when it differs from
    /// the remote, and archives the conflict. On failure the conflict stays
    /// open with its retry counter bumped.
    fn apply_resolution(
        &self,
        conflict: &SyncConflict,
        resolution: Resolution,
        value: EntitySnapshot,
        auto_resolved: bool,
    ) -> SyncResult<()> {
        let inner = &self.inner;
        if let Err(err) = self.write_resolution(conflict, &value) {
            let updated = inner.conflicts.record_failure(conflict.id, &err.to_string())?;
            warn!(
                conflict_id = %conflict.id,
                entity_id = %conflict.entity_id,
                retry_count = updated.retry_count,
                error = %err,
                "conflict resolution failed"
            );
            return Err(err);
        }

        inner
            .conflicts
            .close(conflict.id, resolution, value, auto_resolved)?;
        self.invalidate(conflict.entity_kind, &conflict.entity_id);
        if auto_resolved {
            inner.metrics.record_auto_resolved();
        }
        inner.events.publish(SyncEvent::ConflictResolved {
            conflict_id: conflict.id,
            entity_id: conflict.entity_id.clone(),
            resolution,
            auto_resolved,
        });
        inner.wake.notify_one();
        Ok(())
    }

    fn write_resolution(&self, conflict: &SyncConflict, value: &EntitySnapshot) -> SyncResult<()> {
        let inner = &self.inner;
        let remote = &conflict.remote_snapshot;
        let (kind, id) = (conflict.entity_kind, conflict.entity_id.as_str());

        let settled = value.same_content(remote);
        if settled {
            inner.local.put_entity(value.clone(), remote.version)?;
        } else {
            inner.local.put_resolved(value.clone(), remote.clone())?;
        }
        let discarded = inner.log.discard_pending_for(id)?;
        if discarded > 0 {
            debug!(entity_id = id, discarded, "superseded operations dropped");
        }
        if settled {
            return Ok(());
        }

        let op = if value.deleted {
            SyncOperation::delete(kind, id)
        } else if remote.deleted || remote.version == 0 {
            SyncOperation::create(value.clone())
        } else {
            SyncOperation::update(value.clone())
        };
        let op_id = inner.log.enqueue(op.with_base_version(remote.version))?;
        debug!(op_id, entity_id = id, "resolved value queued for propagation");
        Ok(())
    }
}

/// The operation that propagates a local edit.
fn operation_for(record: &LocalRecord) -> SyncOperation {
    let snapshot = &record.snapshot;
    let op = if snapshot.deleted {
        SyncOperation::delete(snapshot.kind, snapshot.id.clone())
    } else if record.synced_version == 0 {
        SyncOperation::create(snapshot.clone())
    } else {
        SyncOperation::update(snapshot.clone())
    };
    op.with_base_version(record.synced_version)
}

//! The Operation Log: the durable queue of pending local mutations.

use crate::clock::now_millis;
use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::journal::{Journal, JournalRecord};
use cardsync_protocol::{OperationStatus, Priority, SyncOperation};
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// What happened to an operation reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back in the queue, eligible again at `next_eligible_at_ms`.
    Requeued {
        /// Failed transmissions so far.
        attempt: u32,
        /// Earliest time of the next attempt.
        next_eligible_at_ms: u64,
    },
    /// Moved to the dead-letter set.
    DeadLettered,
}

#[derive(Debug, Default)]
struct LogState {
    ops: BTreeMap<u64, SyncOperation>,
    next_id: u64,
}

impl LogState {
    fn get_mut(&mut self, op_id: u64) -> SyncResult<&mut SyncOperation> {
        self.ops
            .get_mut(&op_id)
            .ok_or_else(|| SyncError::NotFound(format!("operation {op_id}")))
    }

    /// The oldest unfinished operation of every entity.
    fn heads(&self) -> HashMap<&str, &SyncOperation> {
        let mut heads: HashMap<&str, &SyncOperation> = HashMap::new();
        for op in self.ops.values() {
            if matches!(
                op.status,
                OperationStatus::Pending | OperationStatus::InFlight
            ) {
                heads.entry(op.entity_id.as_str()).or_insert(op);
            }
        }
        heads
    }
}

/// Durable, ordered record of pending local mutations.
///
/// # Ordering
///
/// Operations drain priority-then-FIFO: `high` before `normal` before
/// `low`, and by enqueue order within a priority. Only the oldest
/// unfinished operation of an entity is eligible, and never while another
/// operation of that entity is in flight, so two mutations of one entity
/// never travel together or out of order.
///
/// # Durability
///
/// Every state change is journaled and synced before the call returns.
/// Dead-lettered operations stay in the log with status `failed` until
/// they are requeued.
pub struct OperationLog {
    journal: Journal,
    state: RwLock<LogState>,
    max_retries: u32,
    retry: RetryConfig,
}

impl OperationLog {
    /// Loads the log from the journal.
    pub fn open(journal: Journal, max_retries: u32, retry: RetryConfig) -> Self {
        let ops = journal.state().operations;
        let next_id = ops.keys().next_back().map_or(1, |id| id + 1);
        debug!(operations = ops.len(), next_id, "operation log loaded");
        Self {
            journal,
            state: RwLock::new(LogState { ops, next_id }),
            max_retries: max_retries.max(1),
            retry,
        }
    }

    /// Queues a mutation and returns its id.
    ///
    /// The operation is durable when this returns.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidOperation`] if the operation has no
    /// entity id. Nothing is queued in that case.
    pub fn enqueue(&self, mut op: SyncOperation) -> SyncResult<u64> {
        op.ensure_entity_id()?;

        let mut state = self.state.write();
        op.op_id = state.next_id;
        op.enqueued_at_ms = now_millis();
        op.status = OperationStatus::Pending;
        op.attempt = 0;
        op.next_eligible_at_ms = 0;
        op.last_error = None;

        self.journal
            .append(JournalRecord::OperationUpserted(op.clone()))?;
        state.next_id += 1;
        let op_id = op.op_id;
        debug!(
            op_id,
            entity_id = %op.entity_id,
            op_type = %op.op_type,
            priority = %op.priority,
            "operation enqueued"
        );
        state.ops.insert(op_id, op);
        Ok(op_id)
    }

    /// Takes up to `max_count` eligible operations and marks them in flight.
    pub fn dequeue_batch(&self, max_count: usize) -> SyncResult<Vec<SyncOperation>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let now = now_millis();
        let mut state = self.state.write();

        let mut eligible: Vec<(Reverse<Priority>, u64)> = state
            .heads()
            .into_values()
            .filter(|op| op.status == OperationStatus::Pending && op.next_eligible_at_ms <= now)
            .map(|op| (Reverse(op.priority), op.op_id))
            .collect();
        eligible.sort_unstable();
        eligible.truncate(max_count);

        let mut batch = Vec::with_capacity(eligible.len());
        for (_, op_id) in eligible {
            let mut op = state.get_mut(op_id)?.clone();
            op.status = OperationStatus::InFlight;
            self.journal
                .append(JournalRecord::OperationUpserted(op.clone()))?;
            state.ops.insert(op_id, op.clone());
            batch.push(op);
        }
        Ok(batch)
    }

    /// Removes an acknowledged operation.
    pub fn mark_completed(&self, op_id: u64) -> SyncResult<()> {
        self.remove(op_id)?;
        debug!(op_id, "operation completed");
        Ok(())
    }

    /// Records one failed transmission.
    ///
    /// Every transmission counts against the operation's budget of
    /// `max_retries`: the operation is requeued with backoff until the
    /// budget is spent, then dead-lettered.
    pub fn mark_failed(&self, op_id: u64, reason: &str) -> SyncResult<FailureOutcome> {
        self.fail(op_id, reason, 1, false)
    }

    /// Records `transmissions` failed sends of a batch that gave up, and
    /// lowers the priority of the operation.
    pub fn requeue_lowered(
        &self,
        op_id: u64,
        reason: &str,
        transmissions: u32,
    ) -> SyncResult<FailureOutcome> {
        self.fail(op_id, reason, transmissions, true)
    }

    /// Transmissions `op` may still make before it is dead-lettered.
    pub fn remaining_budget(&self, op: &SyncOperation) -> u32 {
        self.max_retries.saturating_sub(op.attempt)
    }

    fn fail(
        &self,
        op_id: u64,
        reason: &str,
        transmissions: u32,
        lower: bool,
    ) -> SyncResult<FailureOutcome> {
        let mut state = self.state.write();
        let mut op = state.get_mut(op_id)?.clone();

        op.attempt = op.attempt.saturating_add(transmissions.max(1));
        op.last_error = Some(reason.to_string());
        if lower {
            op.priority = op.priority.lowered();
        }

        let outcome = if op.attempt >= self.max_retries {
            op.status = OperationStatus::Failed;
            FailureOutcome::DeadLettered
        } else {
            let delay = self.retry.delay_for_attempt(op.attempt);
            op.status = OperationStatus::Pending;
            op.next_eligible_at_ms =
                now_millis().saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
            FailureOutcome::Requeued {
                attempt: op.attempt,
                next_eligible_at_ms: op.next_eligible_at_ms,
            }
        };

        self.journal
            .append(JournalRecord::OperationUpserted(op.clone()))?;
        match outcome {
            FailureOutcome::DeadLettered => warn!(
                op_id,
                entity_id = %op.entity_id,
                attempt = op.attempt,
                reason,
                "operation dead-lettered after exhausting its retry budget"
            ),
            FailureOutcome::Requeued { attempt, .. } => debug!(
                op_id,
                attempt,
                priority = %op.priority,
                reason,
                "operation requeued"
            ),
        }
        state.ops.insert(op_id, op);
        Ok(outcome)
    }

    /// Moves an operation straight to the dead-letter set.
    ///
    /// Accepts operations that were never queued, such as malformed ones
    /// handed directly to the transfer engine.
    pub fn dead_letter(&self, mut op: SyncOperation, reason: &str) -> SyncResult<()> {
        let mut state = self.state.write();
        if !state.ops.contains_key(&op.op_id) {
            op.op_id = state.next_id;
        }
        op.status = OperationStatus::Failed;
        op.last_error = Some(reason.to_string());

        self.journal
            .append(JournalRecord::OperationUpserted(op.clone()))?;
        if op.op_id == state.next_id {
            state.next_id += 1;
        }
        warn!(op_id = op.op_id, entity_id = %op.entity_id, reason, "operation dead-lettered");
        state.ops.insert(op.op_id, op);
        Ok(())
    }

    /// Puts a dead-lettered operation back in the queue with a fresh retry budget.
    pub fn requeue_dead_letter(&self, op_id: u64) -> SyncResult<()> {
        let mut state = self.state.write();
        let mut op = state.get_mut(op_id)?.clone();
        if op.status != OperationStatus::Failed {
            return Err(SyncError::NotFound(format!("dead letter {op_id}")));
        }

        op.status = OperationStatus::Pending;
        op.attempt = 0;
        op.priority = Priority::Normal;
        op.next_eligible_at_ms = 0;
        op.last_error = None;

        self.journal
            .append(JournalRecord::OperationUpserted(op.clone()))?;
        debug!(op_id, "dead letter requeued");
        state.ops.insert(op_id, op);
        Ok(())
    }

    /// Returns an in-flight operation to the queue without counting an attempt.
    pub fn release(&self, op_id: u64) -> SyncResult<()> {
        let mut state = self.state.write();
        let mut op = state.get_mut(op_id)?.clone();
        if op.status != OperationStatus::InFlight {
            return Ok(());
        }
        op.status = OperationStatus::Pending;
        self.journal
            .append(JournalRecord::OperationUpserted(op.clone()))?;
        state.ops.insert(op_id, op);
        Ok(())
    }

    /// Releases every in-flight operation.
    pub fn release_in_flight(&self) -> SyncResult<usize> {
        let in_flight: Vec<u64> = self
            .state
            .read()
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::InFlight)
            .map(|op| op.op_id)
            .collect();
        for op_id in &in_flight {
            self.release(*op_id)?;
        }
        Ok(in_flight.len())
    }

    /// Removes an operation whose content was superseded, e.g. by a conflict resolution.
    pub fn remove(&self, op_id: u64) -> SyncResult<SyncOperation> {
        let mut state = self.state.write();
        if !state.ops.contains_key(&op_id) {
            return Err(SyncError::NotFound(format!("operation {op_id}")));
        }
        self.journal
            .append(JournalRecord::OperationRemoved { op_id })?;
        state
            .ops
            .remove(&op_id)
            .ok_or_else(|| SyncError::NotFound(format!("operation {op_id}")))
    }

    /// Drops the queued (not in-flight) operations of an entity.
    pub fn discard_pending_for(&self, entity_id: &str) -> SyncResult<usize> {
        let stale: Vec<u64> = self
            .state
            .read()
            .ops
            .values()
            .filter(|op| op.entity_id == entity_id && op.status == OperationStatus::Pending)
            .map(|op| op.op_id)
            .collect();
        for op_id in &stale {
            self.remove(*op_id)?;
        }
        Ok(stale.len())
    }

    /// Returns true if the entity has a queued or in-flight operation.
    pub fn has_pending_for(&self, entity_id: &str) -> bool {
        self.state.read().ops.values().any(|op| {
            op.entity_id == entity_id
                && matches!(
                    op.status,
                    OperationStatus::Pending | OperationStatus::InFlight
                )
        })
    }

    /// Returns the earliest time a currently ineligible operation becomes eligible.
    ///
    /// `None` when nothing is waiting.
    pub fn next_eligible_at(&self) -> Option<u64> {
        let state = self.state.read();
        state
            .heads()
            .into_values()
            .filter(|op| op.status == OperationStatus::Pending)
            .map(|op| op.next_eligible_at_ms)
            .min()
    }

    /// Returns an operation by id.
    pub fn get(&self, op_id: u64) -> Option<SyncOperation> {
        self.state.read().ops.get(&op_id).cloned()
    }

    /// Returns queued and in-flight operations in drain order.
    pub fn pending(&self) -> Vec<SyncOperation> {
        let state = self.state.read();
        let mut ops: Vec<SyncOperation> = state
            .ops
            .values()
            .filter(|op| op.status != OperationStatus::Failed)
            .cloned()
            .collect();
        ops.sort_by_key(|op| (Reverse(op.priority), op.op_id));
        ops
    }

    /// Returns the dead-letter set.
    pub fn dead_letters(&self) -> Vec<SyncOperation> {
        self.state
            .read()
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::Failed)
            .cloned()
            .collect()
    }

    /// Number of queued operations.
    pub fn pending_count(&self) -> usize {
        self.count(OperationStatus::Pending)
    }

    /// Number of in-flight operations.
    pub fn in_flight_count(&self) -> usize {
        self.count(OperationStatus::InFlight)
    }

    fn count(&self, status: OperationStatus) -> usize {
        self.state
            .read()
            .ops
            .values()
            .filter(|op| op.status == status)
            .count()
    }

    /// Transmissions an operation gets before it is dead-lettered.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl std::fmt::Debug for OperationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationLog")
            .field("operations", &self.state.read().ops.len())
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardsync_protocol::{EntityKind, EntitySnapshot, OperationType};
    use cardsync_storage::InMemoryBackend;
    use proptest::prelude::*;

    fn log() -> OperationLog {
        OperationLog::open(Journal::in_memory().unwrap(), 3, RetryConfig::no_retry())
    }

    fn update(entity: &str) -> SyncOperation {
        let snapshot = EntitySnapshot::new(EntityKind::Card, entity).with_field("front", "Q");
        SyncOperation::update(snapshot)
    }

    fn ids(ops: &[SyncOperation]) -> Vec<u64> {
        ops.iter().map(|op| op.op_id).collect()
    }

    #[test]
    fn enqueue_assigns_increasing_ids() {
        let log = log();
        let a = log.enqueue(update("a")).unwrap();
        let b = log.enqueue(update("b")).unwrap();
        assert!(b > a);
        assert_eq!(log.pending_count(), 2);
        assert!(log.get(a).unwrap().enqueued_at_ms > 0);
    }

    #[test]
    fn enqueue_rejects_missing_entity_id() {
        let log = log();
        let op = SyncOperation::new(OperationType::Update, EntityKind::Card, "", None);
        assert!(matches!(
            log.enqueue(op),
            Err(SyncError::InvalidOperation(_))
        ));
        assert_eq!(log.pending_count(), 0);
    }

    #[test]
    fn high_priority_drains_first_then_fifo() {
        let log = log();
        let low = log.enqueue(update("a").with_priority(Priority::Low)).unwrap();
        let normal1 = log.enqueue(update("b")).unwrap();
        let high = log.enqueue(update("c").with_priority(Priority::High)).unwrap();
        let normal2 = log.enqueue(update("d")).unwrap();

        let batch = log.dequeue_batch(10).unwrap();
        assert_eq!(ids(&batch), vec![high, normal1, normal2, low]);
        assert!(batch
            .iter()
            .all(|op| op.status == OperationStatus::InFlight));
    }

    #[test]
    fn one_operation_per_entity_in_flight() {
        let log = log();
        let first = log.enqueue(update("a")).unwrap();
        let second = log.enqueue(update("a").with_priority(Priority::High)).unwrap();

        let batch = log.dequeue_batch(10).unwrap();
        assert_eq!(ids(&batch), vec![first]);
        assert!(log.dequeue_batch(10).unwrap().is_empty());

        log.mark_completed(first).unwrap();
        assert_eq!(ids(&log.dequeue_batch(10).unwrap()), vec![second]);
    }

    #[test]
    fn dequeue_respects_max_count() {
        let log = log();
        for entity in ["a", "b", "c"] {
            log.enqueue(update(entity)).unwrap();
        }
        assert_eq!(log.dequeue_batch(2).unwrap().len(), 2);
        assert_eq!(log.dequeue_batch(0).unwrap().len(), 0);
        assert_eq!(log.dequeue_batch(5).unwrap().len(), 1);
    }

    #[test]
    fn failures_requeue_then_dead_letter() {
        let log = log();
        let id = log.enqueue(update("a")).unwrap();

        for expected in 1..3 {
            log.dequeue_batch(1).unwrap();
            assert!(matches!(
                log.mark_failed(id, "timeout").unwrap(),
                FailureOutcome::Requeued { attempt, .. } if attempt == expected
            ));
        }
        log.dequeue_batch(1).unwrap();
        assert_eq!(
            log.mark_failed(id, "timeout").unwrap(),
            FailureOutcome::DeadLettered
        );

        assert_eq!(log.pending_count(), 0);
        let dead = log.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt, 3);
        assert!(log.dequeue_batch(10).unwrap().is_empty());
    }

    #[test]
    fn backoff_delays_eligibility() {
        let retry = RetryConfig::new(3)
            .with_initial_delay(std::time::Duration::from_secs(60))
            .with_jitter(false);
        let log = OperationLog::open(Journal::in_memory().unwrap(), 3, retry);
        let id = log.enqueue(update("a")).unwrap();
        log.dequeue_batch(1).unwrap();
        log.mark_failed(id, "timeout").unwrap();

        assert!(log.dequeue_batch(10).unwrap().is_empty());
        assert!(log.next_eligible_at().unwrap() >= now_millis() + 59_000);
    }

    #[test]
    fn requeue_lowered_drops_priority() {
        let log = log();
        let id = log.enqueue(update("a").with_priority(Priority::High)).unwrap();
        log.dequeue_batch(1).unwrap();
        log.requeue_lowered(id, "batch exhausted", 1).unwrap();
        assert_eq!(log.get(id).unwrap().priority, Priority::Normal);
    }

    #[test]
    fn every_transmission_spends_budget() {
        let log = log();
        let id = log.enqueue(update("a")).unwrap();
        let op = log.dequeue_batch(1).unwrap().remove(0);
        assert_eq!(log.remaining_budget(&op), 3);

        assert!(matches!(
            log.requeue_lowered(id, "batch exhausted", 2).unwrap(),
            FailureOutcome::Requeued { attempt: 2, .. }
        ));
        assert_eq!(log.remaining_budget(&log.get(id).unwrap()), 1);

        log.dequeue_batch(1).unwrap();
        assert_eq!(
            log.requeue_lowered(id, "batch exhausted", 1).unwrap(),
            FailureOutcome::DeadLettered
        );
        assert_eq!(log.dead_letters()[0].attempt, 3);
    }

    #[test]
    fn dead_letter_accepts_unqueued_operations() {
        let log = log();
        log.enqueue(update("a")).unwrap();
        let malformed = SyncOperation::new(OperationType::Update, EntityKind::Card, "", None);
        log.dead_letter(malformed, "no entity id").unwrap();

        let dead = log.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].op_id, 2);
        assert_eq!(log.enqueue(update("b")).unwrap(), 3);
    }

    #[test]
    fn requeue_dead_letter_resets_budget() {
        let log = log();
        let id = log.enqueue(update("a").with_priority(Priority::Low)).unwrap();
        let op = log.get(id).unwrap();
        log.dead_letter(op, "rejected").unwrap();
        assert!(log.requeue_dead_letter(id).is_ok());

        let op = log.get(id).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempt, 0);
        assert_eq!(op.priority, Priority::Normal);
        assert!(matches!(
            log.requeue_dead_letter(id),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn release_and_discard() {
        let log = log();
        let a = log.enqueue(update("a")).unwrap();
        let b = log.enqueue(update("b")).unwrap();
        log.enqueue(update("b")).unwrap();
        log.dequeue_batch(10).unwrap();

        assert_eq!(log.in_flight_count(), 2);
        assert_eq!(log.release_in_flight().unwrap(), 2);
        assert_eq!(log.get(a).unwrap().status, OperationStatus::Pending);
        assert_eq!(log.get(a).unwrap().attempt, 0);

        assert_eq!(log.discard_pending_for("b").unwrap(), 2);
        assert!(log.get(b).is_none());
        assert!(log.has_pending_for("a"));
        assert!(!log.has_pending_for("b"));
    }

    #[test]
    fn queue_survives_restart() {
        let backend = InMemoryBackend::new();
        let (a, b) = {
            let log = OperationLog::open(
                Journal::open(Box::new(backend.clone())).unwrap(),
                3,
                RetryConfig::no_retry(),
            );
            let a = log.enqueue(update("a")).unwrap();
            let b = log.enqueue(update("b")).unwrap();
            log.dequeue_batch(1).unwrap();
            (a, b)
        };

        let log = OperationLog::open(
            Journal::open(Box::new(backend)).unwrap(),
            3,
            RetryConfig::no_retry(),
        );
        assert_eq!(log.pending_count(), 2);
        assert_eq!(ids(&log.dequeue_batch(10).unwrap()), vec![a, b]);
        assert!(log.enqueue(update("c")).unwrap() > b);
    }

    proptest! {
        #[test]
        fn dequeue_is_priority_then_fifo(
            priorities in prop::collection::vec(0u8..3, 1..40)
        ) {
            let log = log();
            for (i, p) in priorities.iter().enumerate() {
                let priority = match p {
                    0 => Priority::Low,
                    1 => Priority::Normal,
                    _ => Priority::High,
                };
                log.enqueue(update(&format!("e{i}")).with_priority(priority)).unwrap();
            }

            let batch = log.dequeue_batch(priorities.len()).unwrap();
            prop_assert_eq!(batch.len(), priorities.len());
            for pair in batch.windows(2) {
                prop_assert!(
                    pair[0].priority > pair[1].priority
                        || (pair[0].priority == pair[1].priority && pair[0].op_id < pair[1].op_id)
                );
            }
        }

        #[test]
        fn never_two_in_flight_per_entity(
            entities in prop::collection::vec(0u8..5, 1..40),
            take in 1usize..10,
        ) {
            let log = log();
            for e in &entities {
                log.enqueue(update(&format!("e{e}"))).unwrap();
            }
            let mut seen = std::collections::HashSet::new();
            for _ in 0..3 {
                for op in log.dequeue_batch(take).unwrap() {
                    prop_assert!(seen.insert(op.entity_id.clone()));
                }
            }
        }
    }
}

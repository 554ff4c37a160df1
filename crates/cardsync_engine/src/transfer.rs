//! The Batch Transfer Engine.
//!
//! Operations are grouped into batches and sent with bounded parallelism.
//! Two operations of the same entity never travel at the same time: the
//! input is split into waves holding at most one operation per entity, and
//! a wave is only started once the previous one has settled.
//!
//! A failing push batch is resent as a whole, with backoff, while every
//! operation in it has retry budget left. Each send is charged to each of
//! its operations, so an operation makes at most `max_retries` sends in
//! total however they are split across rounds. A batch that gives up has
//! its operations requeued at lowered priority; they travel alone from
//! then on.

use crate::backoff::call_counted;
use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::network::TransferParams;
use crate::oplog::{FailureOutcome, OperationLog};
use crate::store::RemoteStore;
use cardsync_protocol::{
    AckOutcome, BatchAck, BatchRequest, Direction, EntitySnapshot, SyncOperation,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// An operation the remote store applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredOperation {
    /// The operation as sent.
    pub op: SyncOperation,
    /// Version assigned by the remote store.
    pub version: u64,
    /// Remote snapshot returned with the acknowledgement.
    pub snapshot: Option<EntitySnapshot>,
}

/// An operation the remote store refused because it moved past the base version.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictedOperation {
    /// The operation as sent.
    pub op: SyncOperation,
    /// Remote snapshot returned with the acknowledgement.
    pub remote: Option<EntitySnapshot>,
}

/// An operation that failed in this round.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedOperation {
    /// The operation as sent.
    pub op: SyncOperation,
    /// Why it failed.
    pub reason: String,
}

/// Outcome of one [`BatchTransferEngine::transfer`] call.
#[derive(Debug, Default)]
pub struct TransferResult {
    /// Applied operations. Push operations stay in flight in the log until
    /// the caller records them as completed.
    pub succeeded: Vec<DeliveredOperation>,
    /// Operations requeued for a later round.
    pub failed: Vec<FailedOperation>,
    /// Operations rejected as stale by the remote. Still in flight in the log.
    pub conflicts: Vec<ConflictedOperation>,
    /// Operations moved to the dead-letter set.
    pub dead_lettered: Vec<FailedOperation>,
    /// Operations never sent because the transfer stopped early.
    pub released: Vec<u64>,
    /// Batches that exhausted their retries.
    pub degraded_batches: usize,
    /// Batches handed to the remote store.
    pub batches_sent: usize,
    /// Approximate bytes put on the wire.
    pub bytes_sent: u64,
    /// Error that stopped the transfer, if any.
    pub fatal: Option<SyncError>,
}

impl TransferResult {
    /// Operations that reached a final answer from the remote store.
    pub fn settled(&self) -> usize {
        self.succeeded.len() + self.conflicts.len() + self.dead_lettered.len()
    }
}

/// Sends operations to the remote store in batches.
pub struct BatchTransferEngine<R> {
    remote: Arc<R>,
    log: Arc<OperationLog>,
    device_id: String,
    retry: RetryConfig,
    timeout: Duration,
    stop: Arc<AtomicBool>,
}

struct ChunkOutcome {
    chunk: Vec<SyncOperation>,
    result: SyncResult<BatchAck>,
    transmissions: u32,
}

impl<R: RemoteStore> BatchTransferEngine<R> {
    /// Creates an engine using the device id, retry policy and timeout of `config`.
    pub fn new(remote: Arc<R>, log: Arc<OperationLog>, config: &SyncConfig) -> Self {
        Self {
            remote,
            log,
            device_id: config.device_id.clone(),
            retry: config.retry.clone(),
            timeout: config.request_timeout,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares a stop flag; once set, no further batch is admitted.
    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Sends `ops` and sorts every operation into the result.
    ///
    /// Push operations must have been taken from the log with
    /// [`OperationLog::dequeue_batch`]; failures are recorded there. Pull
    /// operations are synthetic lookups and never touch the log.
    ///
    /// # Errors
    ///
    /// Only journal failures are returned; network failures are reported in
    /// the result.
    pub async fn transfer(
        &self,
        ops: Vec<SyncOperation>,
        direction: Direction,
        params: TransferParams,
    ) -> SyncResult<TransferResult> {
        let mut result = TransferResult::default();

        let mut valid = Vec::with_capacity(ops.len());
        for op in ops {
            let check = match direction {
                Direction::Push => op.validate(),
                Direction::Pull => op.ensure_entity_id(),
            };
            match check {
                Ok(()) => valid.push(op),
                Err(err) => {
                    let reason = err.to_string();
                    if direction == Direction::Push {
                        self.log.dead_letter(op.clone(), &reason)?;
                    }
                    result.dead_lettered.push(FailedOperation { op, reason });
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(params.parallelism.max(1)));
        let abort = Arc::new(AtomicBool::new(false));

        for wave in waves(valid) {
            let mut tasks = JoinSet::new();
            let mut unsent = Vec::new();

            for chunk in chunks(wave, params.batch_size) {
                if self.stop.load(Ordering::SeqCst) || abort.load(Ordering::SeqCst) {
                    unsent.extend(chunk);
                    continue;
                }
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    unsent.extend(chunk);
                    continue;
                };
                // Re-check: the flags may have flipped while waiting for a permit.
                if self.stop.load(Ordering::SeqCst) || abort.load(Ordering::SeqCst) {
                    unsent.extend(chunk);
                    continue;
                }

                let request = BatchRequest::new(self.device_id.clone(), direction, chunk.clone())
                    .with_compression(params.compress);
                result.batches_sent += 1;
                result.bytes_sent += request.encoded_len() as u64;

                let max_calls = self.max_calls(&chunk, direction);
                let remote = self.remote.clone();
                let retry = self.retry.clone();
                let timeout = self.timeout;
                let abort = abort.clone();
                tasks.spawn(async move {
                    let (outcome, transmissions) =
                        call_counted(&retry, max_calls, timeout, "apply_batch", || {
                            remote.apply_batch(request.clone())
                        })
                        .await;
                    if matches!(&outcome, Err(err) if err.is_fatal()) {
                        abort.store(true, Ordering::SeqCst);
                    }
                    drop(permit);
                    ChunkOutcome {
                        chunk,
                        result: outcome,
                        transmissions,
                    }
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => self.settle(outcome, direction, &mut result)?,
                    Err(err) => {
                        // The chunk is lost with the task; its ops stay in flight
                        // until the caller releases them.
                        warn!(error = %err, "batch task failed");
                        result.fatal.get_or_insert(SyncError::Remote(err.to_string()));
                    }
                }
            }

            for op in unsent {
                if direction == Direction::Push {
                    self.log.release(op.op_id)?;
                }
                result.released.push(op.op_id);
            }
        }

        debug!(
            direction = %direction,
            batches = result.batches_sent,
            succeeded = result.succeeded.len(),
            conflicts = result.conflicts.len(),
            failed = result.failed.len(),
            dead_lettered = result.dead_lettered.len(),
            released = result.released.len(),
            "transfer finished"
        );
        Ok(result)
    }

    /// Sends a batch may make this round. A push batch never outspends
    /// the smallest remaining budget among its operations.
    fn max_calls(&self, chunk: &[SyncOperation], direction: Direction) -> u32 {
        let policy = self.retry.max_attempts;
        if direction == Direction::Pull {
            return policy;
        }
        chunk
            .iter()
            .map(|op| self.log.remaining_budget(op))
            .min()
            .map_or(policy, |budget| policy.min(budget))
            .max(1)
    }

    fn settle(
        &self,
        outcome: ChunkOutcome,
        direction: Direction,
        result: &mut TransferResult,
    ) -> SyncResult<()> {
        let ack = match outcome.result {
            Ok(ack) => ack,
            Err(err) if err.is_fatal() => {
                warn!(error = %err, ops = outcome.chunk.len(), "batch hit a fatal error");
                for op in outcome.chunk {
                    if direction == Direction::Push {
                        self.log.release(op.op_id)?;
                    }
                    result.released.push(op.op_id);
                }
                result.fatal.get_or_insert(err);
                return Ok(());
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    error = %reason,
                    ops = outcome.chunk.len(),
                    transmissions = outcome.transmissions,
                    "batch degraded"
                );
                result.degraded_batches += 1;
                for op in outcome.chunk {
                    self.fail(op, &reason, direction, Some(outcome.transmissions), result)?;
                }
                return Ok(());
            }
        };

        for op in outcome.chunk {
            match ack.outcome_for(op.op_id).cloned() {
                Some(AckOutcome::Applied { version, snapshot }) => {
                    result.succeeded.push(DeliveredOperation {
                        op,
                        version,
                        snapshot,
                    });
                }
                Some(AckOutcome::Conflict { remote }) => {
                    result.conflicts.push(ConflictedOperation { op, remote });
                }
                Some(AckOutcome::Rejected {
                    reason,
                    retryable: true,
                }) => self.fail(op, &reason, direction, None, result)?,
                Some(AckOutcome::Rejected {
                    reason,
                    retryable: false,
                }) => {
                    if direction == Direction::Push {
                        self.log.dead_letter(op.clone(), &reason)?;
                    }
                    result.dead_lettered.push(FailedOperation { op, reason });
                }
                None => self.fail(op, "missing acknowledgement", direction, None, result)?,
            }
        }
        Ok(())
    }

    /// Records a failure. `degraded` carries the sends of a batch that gave
    /// up; its operations are requeued at lowered priority.
    fn fail(
        &self,
        op: SyncOperation,
        reason: &str,
        direction: Direction,
        degraded: Option<u32>,
        result: &mut TransferResult,
    ) -> SyncResult<()> {
        let failed = FailedOperation {
            op,
            reason: reason.to_string(),
        };
        if direction == Direction::Pull {
            result.failed.push(failed);
            return Ok(());
        }

        let outcome = match degraded {
            Some(transmissions) => {
                self.log
                    .requeue_lowered(failed.op.op_id, reason, transmissions)?
            }
            None => self.log.mark_failed(failed.op.op_id, reason)?,
        };
        match outcome {
            FailureOutcome::DeadLettered => result.dead_lettered.push(failed),
            FailureOutcome::Requeued { .. } => result.failed.push(failed),
        }
        Ok(())
    }
}

/// Splits operations into waves holding at most one operation per entity,
/// preserving per-entity order.
fn waves(ops: Vec<SyncOperation>) -> Vec<Vec<SyncOperation>> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut waves: Vec<Vec<SyncOperation>> = Vec::new();
    for op in ops {
        let depth = seen.entry(op.entity_id.clone()).or_insert(0);
        if waves.len() <= *depth {
            waves.push(Vec::new());
        }
        waves[*depth].push(op);
        *depth += 1;
    }
    waves
}

/// Groups a wave into batches. Operations that already failed a round
/// travel alone so they cannot sink a batch again.
fn chunks(wave: Vec<SyncOperation>, batch_size: usize) -> Vec<Vec<SyncOperation>> {
    let batch_size = batch_size.max(1);
    let (retried, fresh): (Vec<_>, Vec<_>) = wave.into_iter().partition(|op| op.attempt > 0);

    let mut out: Vec<Vec<SyncOperation>> = Vec::new();
    let mut current = Vec::with_capacity(batch_size);
    for op in fresh {
        current.push(op);
        if current.len() == batch_size {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out.extend(retried.into_iter().map(|op| vec![op]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::memory::MemoryRemoteStore;
    use cardsync_protocol::{EntityKind, OperationType};

    fn card(id: &str) -> EntitySnapshot {
        EntitySnapshot::new(EntityKind::Card, id).with_field("front", id)
    }

    fn params(batch_size: usize, parallelism: usize) -> TransferParams {
        TransferParams {
            batch_size,
            parallelism,
            compress: false,
        }
    }

    type Fixture = (
        Arc<MemoryRemoteStore>,
        Arc<OperationLog>,
        BatchTransferEngine<MemoryRemoteStore>,
    );

    fn setup(max_retries: u32) -> Fixture {
        let remote = Arc::new(MemoryRemoteStore::new());
        let journal = Journal::in_memory().unwrap();
        let log = Arc::new(OperationLog::open(journal, max_retries, RetryConfig::no_retry()));
        let config = SyncConfig::new("device-a").with_retry(RetryConfig::no_retry());
        let engine = BatchTransferEngine::new(remote.clone(), log.clone(), &config);
        (remote, log, engine)
    }

    #[test]
    fn waves_hold_one_op_per_entity() {
        let ops: Vec<_> = ["a", "b", "a", "c", "a"]
            .iter()
            .map(|id| SyncOperation::create(card(id)))
            .collect();
        let waves = waves(ops);
        let ids: Vec<Vec<&str>> = waves
            .iter()
            .map(|w| w.iter().map(|op| op.entity_id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a", "b", "c"], vec!["a"], vec!["a"]]);
    }

    #[test]
    fn retried_ops_travel_alone() {
        let mut retried = SyncOperation::create(card("r"));
        retried.attempt = 1;
        let mut wave: Vec<_> = (0..5)
            .map(|i| SyncOperation::create(card(&format!("c{i}"))))
            .collect();
        wave.push(retried);

        let chunks = chunks(wave, 2);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1, 1]);
        assert_eq!(chunks[3][0].entity_id, "r");
    }

    #[tokio::test]
    async fn malformed_operation_does_not_sink_its_batch() {
        let (remote, log, engine) = setup(3);
        for i in 0..49 {
            log.enqueue(SyncOperation::create(card(&format!("card-{i}")))).unwrap();
        }
        let mut ops = log.dequeue_batch(100).unwrap();
        let broken = SyncOperation::new(OperationType::Update, EntityKind::Card, "", None);
        ops.insert(22, broken);
        assert_eq!(ops.len(), 50);

        let result = engine.transfer(ops, Direction::Push, params(50, 1)).await.unwrap();

        assert_eq!(result.succeeded.len(), 49);
        assert_eq!(result.dead_lettered.len(), 1);
        assert!(result.dead_lettered[0].op.entity_id.is_empty());
        assert_eq!(log.dead_letters().len(), 1);
        assert_eq!(remote.apply_calls(), 1);
    }

    #[tokio::test]
    async fn parallel_batches_never_share_an_entity() {
        let (remote, log, engine) = setup(3);
        remote.set_latency(Duration::from_millis(5));
        let mut ops = Vec::new();
        for round in 0..3 {
            for i in 0..20 {
                let mut op = SyncOperation::create(card(&format!("card-{i}")));
                op.op_id = round * 100 + i + 1;
                ops.push(op);
            }
        }

        let result = engine.transfer(ops, Direction::Pull, params(4, 4)).await.unwrap();

        assert_eq!(result.succeeded.len() + result.failed.len(), 60);
        assert_eq!(remote.concurrency_violations(), 0);
        assert!(remote.max_concurrent_batches() > 1);
        assert!(remote.max_concurrent_batches() <= 4);
        assert_eq!(log.pending_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_batch_is_requeued_lowered() {
        let (remote, log, engine) = setup(3);
        remote.fail_next(1);
        let op_id = log.enqueue(SyncOperation::create(card("a"))).unwrap();
        let ops = log.dequeue_batch(10).unwrap();

        let result = engine.transfer(ops, Direction::Push, params(10, 1)).await.unwrap();

        assert_eq!(result.degraded_batches, 1);
        assert_eq!(result.failed.len(), 1);
        let op = log.get(op_id).unwrap();
        assert_eq!(op.attempt, 1);
        assert_eq!(op.priority, cardsync_protocol::Priority::Low);
    }

    #[tokio::test]
    async fn batch_retries_share_the_operation_budget() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let log = Arc::new(OperationLog::open(
            Journal::in_memory().unwrap(),
            5,
            RetryConfig::no_retry(),
        ));
        let config = SyncConfig::new("device-a").with_retry(RetryConfig::immediate(3));
        let engine = BatchTransferEngine::new(remote.clone(), log.clone(), &config);
        remote.set_always_fail(true);
        let op_id = log.enqueue(SyncOperation::create(card("a"))).unwrap();

        let ops = log.dequeue_batch(10).unwrap();
        let first = engine.transfer(ops, Direction::Push, params(10, 1)).await.unwrap();
        assert_eq!(first.failed.len(), 1);
        assert_eq!(remote.apply_calls(), 3);
        assert_eq!(log.get(op_id).unwrap().attempt, 3);

        let ops = log.dequeue_batch(10).unwrap();
        let second = engine.transfer(ops, Direction::Push, params(10, 1)).await.unwrap();
        assert_eq!(second.dead_lettered.len(), 1);
        assert_eq!(remote.apply_calls(), 5);
        assert_eq!(log.dead_letters()[0].attempt, 5);
    }

    #[tokio::test]
    async fn authentication_failure_stops_and_releases() {
        let (remote, log, engine) = setup(3);
        remote.set_auth_failure(true);
        for i in 0..6 {
            log.enqueue(SyncOperation::create(card(&format!("c{i}")))).unwrap();
        }
        let ops = log.dequeue_batch(10).unwrap();

        let result = engine.transfer(ops, Direction::Push, params(2, 1)).await.unwrap();

        assert!(matches!(result.fatal, Some(SyncError::AuthenticationFailed(_))));
        assert_eq!(result.released.len(), 6);
        assert_eq!(log.in_flight_count(), 0);
        assert_eq!(log.pending_count(), 6);
        assert!(log.pending().iter().all(|op| op.attempt == 0));
    }

    #[tokio::test]
    async fn stop_signal_holds_back_unsent_batches() {
        let (_remote, log, engine) = setup(3);
        let stop = Arc::new(AtomicBool::new(true));
        let engine = engine.with_stop_signal(stop);
        log.enqueue(SyncOperation::create(card("a"))).unwrap();
        let ops = log.dequeue_batch(10).unwrap();

        let result = engine.transfer(ops, Direction::Push, params(10, 1)).await.unwrap();

        assert_eq!(result.batches_sent, 0);
        assert_eq!(result.released.len(), 1);
        assert_eq!(log.pending_count(), 1);
    }

    #[tokio::test]
    async fn rejected_operations_follow_the_retryable_flag() {
        let (remote, log, engine) = setup(3);
        remote.reject_entity("bad", false);
        remote.reject_entity("flaky", true);
        log.enqueue(SyncOperation::create(card("bad"))).unwrap();
        log.enqueue(SyncOperation::create(card("flaky"))).unwrap();
        log.enqueue(SyncOperation::create(card("ok"))).unwrap();
        let ops = log.dequeue_batch(10).unwrap();

        let result = engine.transfer(ops, Direction::Push, params(10, 1)).await.unwrap();

        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(result.dead_lettered.len(), 1);
        assert_eq!(result.dead_lettered[0].op.entity_id, "bad");
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].op.entity_id, "flaky");
    }
}

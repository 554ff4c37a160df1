//! Requeue command implementation.

use super::open_journal;
use cardsync_engine::{OperationLog, RetryConfig, SyncConfig};
use std::path::Path;
use tracing::info;

/// Runs the requeue command.
pub fn run(path: &Path, op_id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let defaults = SyncConfig::default();
    let log = OperationLog::open(open_journal(path)?, defaults.max_retries, RetryConfig::default());
    log.requeue_dead_letter(op_id)?;
    info!(op_id, "dead letter requeued");
    println!("Operation #{op_id} requeued.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardsync_engine::{Journal, OperationStatus, SyncOperation};
    use cardsync_testkit::{card, TempJournal};

    #[test]
    fn requeues_a_dead_letter_on_disk() {
        let journal = TempJournal::new();
        let op_id = {
            let log = OperationLog::open(
                Journal::open(Box::new(journal.backend())).unwrap(),
                1,
                RetryConfig::no_retry(),
            );
            let id = log.enqueue(SyncOperation::create(card("c1", "A"))).unwrap();
            log.dequeue_batch(1).unwrap();
            log.mark_failed(id, "rejected").unwrap();
            id
        };

        run(journal.path(), op_id).unwrap();

        let state = open_journal(journal.path()).unwrap().state();
        let op = &state.operations[&op_id];
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempt, 0);
        assert!(run(journal.path(), op_id).is_err());
    }
}

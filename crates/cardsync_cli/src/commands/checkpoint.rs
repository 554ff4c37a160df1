//! Checkpoint command implementation.

use super::{format_ms, open_journal, print_json, Format};
use cardsync_engine::{OperationStatus, SyncCheckpoint};
use serde::Serialize;
use std::path::Path;

/// Journal summary.
#[derive(Debug, Serialize)]
pub struct CheckpointInfo {
    /// Persisted checkpoint.
    #[serde(flatten)]
    pub checkpoint: SyncCheckpoint,
    /// Journal size in bytes.
    pub journal_bytes: u64,
    /// Queued or in-flight operations.
    pub pending: usize,
    /// Dead-lettered operations.
    pub dead_letters: usize,
    /// Open conflicts.
    pub open_conflicts: usize,
}

/// Runs the checkpoint command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let journal = open_journal(path)?;
    let state = journal.state();
    let dead_letters = state
        .operations
        .values()
        .filter(|op| op.status == OperationStatus::Failed)
        .count();
    let info = CheckpointInfo {
        checkpoint: state.checkpoint,
        journal_bytes: journal.size()?,
        pending: state.operations.len() - dead_letters,
        dead_letters,
        open_conflicts: state.open_conflicts.len(),
    };

    match format {
        Format::Json => print_json(&info)?,
        Format::Text => {
            println!("Journal:            {}", path.display());
            println!("  Size:             {} bytes", info.journal_bytes);
            println!("  Last full sync:   {}", format_ms(info.checkpoint.last_full_sync_ms));
            println!(
                "  Last incremental: {}",
                format_ms(info.checkpoint.last_incremental_sync_ms)
            );
            println!("  Remote cursor:    {}", info.checkpoint.remote_cursor);
            println!("  Pending:          {}", info.pending);
            println!("  Dead letters:     {}", info.dead_letters);
            println!("  Open conflicts:   {}", info.open_conflicts);
        }
    }
    Ok(())
}

//! Queue and dead-letter listing.

use super::{open_journal, print_json, Format};
use cardsync_engine::{OperationStatus, SyncOperation};
use serde::Serialize;
use std::path::Path;

/// One operation as printed.
#[derive(Debug, Serialize)]
pub struct OperationInfo {
    /// Operation id.
    pub op_id: u64,
    /// Mutation type.
    pub op_type: String,
    /// `kind/id` of the target.
    pub entity: String,
    /// Drain priority.
    pub priority: String,
    /// Lifecycle status.
    pub status: String,
    /// Failed transmissions.
    pub attempt: u32,
    /// Last failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&SyncOperation> for OperationInfo {
    fn from(op: &SyncOperation) -> Self {
        Self {
            op_id: op.op_id,
            op_type: op.op_type.to_string(),
            entity: op.entity_key(),
            priority: op.priority.to_string(),
            status: op.status.to_string(),
            attempt: op.attempt,
            last_error: op.last_error.clone(),
        }
    }
}

/// Runs the queue (or dead-letters) command.
pub fn run(
    path: &Path,
    dead_letters: bool,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let journal = open_journal(path)?;
    let all: Vec<SyncOperation> = journal.state().operations.into_values().collect();
    let ops = select(&all, dead_letters);

    match format {
        Format::Json => print_json(&ops)?,
        Format::Text => print_text(&ops, dead_letters),
    }
    Ok(())
}

/// Picks dead letters, or everything else.
pub fn select(ops: &[SyncOperation], dead_letters: bool) -> Vec<OperationInfo> {
    ops.iter()
        .filter(|op| (op.status == OperationStatus::Failed) == dead_letters)
        .map(OperationInfo::from)
        .collect()
}

fn print_text(ops: &[OperationInfo], dead_letters: bool) {
    let what = if dead_letters { "dead letters" } else { "queued operations" };
    if ops.is_empty() {
        println!("No {what}.");
        return;
    }
    println!("{} {what}:", ops.len());
    for op in ops {
        print!(
            "  #{:<6} {:<7} {:<24} {:<7} {:<10} attempt {}",
            op.op_id, op.op_type, op.entity, op.priority, op.status, op.attempt
        );
        match &op.last_error {
            Some(err) => println!("  ({err})"),
            None => println!(),
        }
    }
}

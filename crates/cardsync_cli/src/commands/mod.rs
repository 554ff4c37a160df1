//! CLI command implementations.

pub mod checkpoint;
pub mod compact;
pub mod conflicts;
pub mod queue;
pub mod requeue;

use cardsync_engine::Journal;
use cardsync_storage::FileBackend;
use serde::Serialize;
use std::path::Path;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human-readable lines.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Opens an existing journal. Replaying it also repairs a torn tail.
pub fn open_journal(path: &Path) -> Result<Journal, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No journal found at {}", path.display()).into());
    }
    let backend = FileBackend::open(path)?;
    Ok(Journal::open(Box::new(backend))?)
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Formats a unix-millisecond timestamp for text output.
pub fn format_ms(ms: Option<u64>) -> String {
    match ms {
        Some(ms) => format!("{ms} ms"),
        None => "never".to_string(),
    }
}

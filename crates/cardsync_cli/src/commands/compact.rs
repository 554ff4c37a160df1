//! Compact command implementation.

use super::{open_journal, print_json, Format};
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let stats = open_journal(path)?.compact()?;
    match format {
        Format::Json => print_json(&stats)?,
        Format::Text => {
            let saved = stats.bytes_before.saturating_sub(stats.bytes_after);
            println!("Compacted {}", path.display());
            println!("  Records kept: {}", stats.records);
            println!(
                "  Size:         {} -> {} bytes ({} reclaimed)",
                stats.bytes_before, stats.bytes_after, saved
            );
        }
    }
    Ok(())
}

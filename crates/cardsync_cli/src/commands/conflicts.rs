//! Conflict listing.

use super::{format_ms, open_journal, print_json, Format};
use cardsync_engine::SyncConflict;
use serde::Serialize;
use std::path::Path;

/// One conflict as printed.
#[derive(Debug, Serialize)]
pub struct ConflictInfo {
    /// Conflict id.
    pub id: String,
    /// `kind/id` of the entity.
    pub entity: String,
    /// Divergence kind.
    pub kind: String,
    /// Resolution, `pending` while open.
    pub resolution: String,
    /// Local version when detected.
    pub local_version: u64,
    /// Remote version when detected.
    pub remote_version: u64,
    /// Failed resolution attempts.
    pub retry_count: u32,
    /// Whether a policy resolved it.
    pub auto_resolved: bool,
    /// Detection time (unix ms).
    pub detected_at_ms: u64,
    /// Resolution time (unix ms).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<u64>,
    /// Last resolution failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&SyncConflict> for ConflictInfo {
    fn from(c: &SyncConflict) -> Self {
        Self {
            id: c.id.to_string(),
            entity: c.entity_key(),
            kind: c.conflict_kind.to_string(),
            resolution: c.resolution.to_string(),
            local_version: c.local_snapshot.version,
            remote_version: c.remote_snapshot.version,
            retry_count: c.retry_count,
            auto_resolved: c.auto_resolved,
            detected_at_ms: c.detected_at_ms,
            resolved_at_ms: c.resolved_at_ms,
            last_error: c.last_error.clone(),
        }
    }
}

/// Runs the conflicts command.
pub fn run(path: &Path, history: bool, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let state = open_journal(path)?.state();
    let conflicts: Vec<ConflictInfo> = if history {
        state.archived_conflicts.iter().map(ConflictInfo::from).collect()
    } else {
        state.open_conflicts.values().map(ConflictInfo::from).collect()
    };

    match format {
        Format::Json => print_json(&conflicts)?,
        Format::Text => {
            let what = if history { "resolved conflicts" } else { "open conflicts" };
            if conflicts.is_empty() {
                println!("No {what}.");
                return Ok(());
            }
            println!("{} {what}:", conflicts.len());
            for c in &conflicts {
                println!(
                    "  {}  {:<24} {:<16} {:<11} local v{} / remote v{}  retries {}",
                    c.id,
                    c.entity,
                    c.kind,
                    c.resolution,
                    c.local_version,
                    c.remote_version,
                    c.retry_count
                );
                if history {
                    println!(
                        "      resolved at {}{}",
                        format_ms(c.resolved_at_ms),
                        if c.auto_resolved { " (auto)" } else { "" }
                    );
                }
                if let Some(err) = &c.last_error {
                    println!("      last error: {err}");
                }
            }
        }
    }
    Ok(())
}

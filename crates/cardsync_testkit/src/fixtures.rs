//! Test fixtures.
//!
//! Snapshot builders for the entity kinds the card manager syncs, and a
//! temporary directory that keeps a journal file alive across reopenings.

use cardsync_protocol::{EntityKind, EntitySnapshot};
use cardsync_storage::FileBackend;
use serde_json::json;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A never-synced card with a front side.
pub fn card(id: &str, front: &str) -> EntitySnapshot {
    EntitySnapshot::new(EntityKind::Card, id).with_field("front", front)
}

/// A card with both sides and tags.
pub fn full_card(id: &str, front: &str, back: &str, tags: &[&str]) -> EntitySnapshot {
    card(id, front)
        .with_field("back", back)
        .with_field("tags", json!(tags))
}

/// A folder.
pub fn folder(id: &str, name: &str) -> EntitySnapshot {
    EntitySnapshot::new(EntityKind::Folder, id).with_field("name", name)
}

/// A tag.
pub fn tag(id: &str, label: &str) -> EntitySnapshot {
    EntitySnapshot::new(EntityKind::Tag, id).with_field("label", label)
}

/// `count` cards with ids `card-0`, `card-1`, ...
pub fn cards(count: usize) -> Vec<EntitySnapshot> {
    (0..count)
        .map(|i| card(&format!("card-{i}"), &format!("Question {i}")))
        .collect()
}

/// A journal file in a temporary directory, removed on drop.
pub struct TempJournal {
    path: PathBuf,
    _dir: TempDir,
}

impl TempJournal {
    /// Creates an empty directory for the journal.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("sync").join("journal.csjl");
        Self { path, _dir: dir }
    }

    /// Opens a backend on the journal file. Call again to simulate a restart.
    pub fn backend(&self) -> FileBackend {
        FileBackend::open_with_create_dirs(&self.path).expect("Failed to open journal backend")
    }

    /// The journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for TempJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardsync_storage::StorageBackend;

    #[test]
    fn builders_set_kind_and_fields() {
        let c = full_card("c1", "Q", "A", &["physics"]);
        assert_eq!(c.kind, EntityKind::Card);
        assert_eq!(c.text("back"), Some("A"));
        assert_eq!(folder("f1", "Inbox").kind, EntityKind::Folder);
        assert_eq!(cards(3)[2].id, "card-2");
    }

    #[test]
    fn temp_journal_survives_reopen() {
        let journal = TempJournal::new();
        {
            let mut backend = journal.backend();
            backend.append(b"frame").unwrap();
            backend.sync().unwrap();
        }
        assert_eq!(journal.backend().size().unwrap(), 5);
        assert!(journal.path().exists());
    }
}

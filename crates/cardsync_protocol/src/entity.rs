//! Versioned entity snapshots.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The kinds of record the card manager keeps in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    /// A knowledge card.
    Card,
    /// A folder grouping cards.
    Folder,
    /// A tag.
    Tag,
    /// An image attached to a card.
    Image,
    /// A user setting.
    Setting,
}

impl EntityKind {
    /// All kinds, in a stable order.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Card,
        EntityKind::Folder,
        EntityKind::Tag,
        EntityKind::Image,
        EntityKind::Setting,
    ];

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Card => "card",
            EntityKind::Folder => "folder",
            EntityKind::Tag => "tag",
            EntityKind::Image => "image",
            EntityKind::Setting => "setting",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownValue {
                kind: "entity kind",
                value: s.to_string(),
            })
    }
}

/// The state of one entity at one version.
///
/// `version` is the per-entity counter assigned by the remote store when a
/// write is accepted; `0` means the entity has never been synced.
/// `updated_at_ms` is the wall-clock time of the last edit and is only
/// used to order concurrent edits. Structured content lives in `fields`,
/// keyed by field name (`front`, `back`, `tags`, `style`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Entity kind.
    pub kind: EntityKind,
    /// Client-chosen entity id.
    pub id: String,
    /// Version marker.
    pub version: u64,
    /// Last edit time in unix milliseconds.
    pub updated_at_ms: u64,
    /// Tombstone flag.
    pub deleted: bool,
    /// Field values.
    pub fields: BTreeMap<String, Value>,
}

impl EntitySnapshot {
    /// Creates an empty, never-synced snapshot.
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            version: 0,
            updated_at_ms: 0,
            deleted: false,
            fields: BTreeMap::new(),
        }
    }

    /// Sets a field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets the version marker.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Sets the edit timestamp.
    pub fn with_updated_at(mut self, updated_at_ms: u64) -> Self {
        self.updated_at_ms = updated_at_ms;
        self
    }

    /// Returns a tombstone of this entity.
    pub fn tombstone(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Returns a field value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns a text field.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// Returns `kind/id`, the form used in logs and error messages.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.id)
    }

    /// Returns true when both snapshots carry the same user-visible state.
    ///
    /// Version and timestamp are ignored: two devices that typed the same
    /// text agree even if they did so at different times.
    pub fn same_content(&self, other: &EntitySnapshot) -> bool {
        self.kind == other.kind
            && self.id == other.id
            && self.deleted == other.deleted
            && self.fields == other.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_kind_text_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("notebook".parse::<EntityKind>().is_err());
    }

    #[test]
    fn entity_kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&EntityKind::Setting).unwrap(),
            "\"setting\""
        );
    }

    #[test]
    fn snapshot_builder() {
        let card = EntitySnapshot::new(EntityKind::Card, "c1")
            .with_field("front", "What is Rust?")
            .with_field("tags", json!(["lang"]))
            .with_version(3)
            .with_updated_at(1_000);

        assert_eq!(card.text("front"), Some("What is Rust?"));
        assert_eq!(card.field("tags"), Some(&json!(["lang"])));
        assert_eq!(card.version, 3);
        assert_eq!(card.key(), "card/c1");
        assert!(!card.deleted);
    }

    #[test]
    fn same_content_ignores_version_and_time() {
        let a = EntitySnapshot::new(EntityKind::Card, "c1")
            .with_field("front", "A")
            .with_version(1)
            .with_updated_at(10);
        let b = a.clone().with_version(7).with_updated_at(99);
        assert!(a.same_content(&b));

        let c = a.clone().with_field("front", "B");
        assert!(!a.same_content(&c));
        assert!(!a.same_content(&a.clone().tombstone()));
    }
}

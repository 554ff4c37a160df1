//! Property-based test generators using proptest.
//!
//! Field values stay within the shapes the card manager actually stores:
//! text, numbers, tag lists and small style objects.

use cardsync_protocol::{EntityKind, EntitySnapshot, OperationType, Priority, SyncOperation};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;

const FIELD_NAMES: [&str; 5] = ["front", "back", "tags", "style", "position"];

/// Strategy for entity kinds.
pub fn arb_entity_kind() -> impl Strategy<Value = EntityKind> {
    prop::sample::select(EntityKind::ALL.to_vec())
}

/// Strategy for short entity ids.
pub fn arb_entity_id() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,11}").expect("Invalid regex")
}

/// Strategy for operation priorities.
pub fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High)
    ]
}

/// Strategy for one field value.
pub fn arb_field_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[A-Za-z ]{0,16}".prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        prop::collection::vec("[a-z]{1,6}", 0..4).prop_map(|tags| json!(tags)),
        (prop::sample::select(vec!["red", "blue", "green"]), 8u8..24)
            .prop_map(|(color, size)| json!({ "color": color, "size": size })),
    ]
}

/// Strategy for a field map over the card field names.
pub fn arb_fields() -> impl Strategy<Value = BTreeMap<String, Value>> {
    prop::collection::btree_map(
        prop::sample::select(FIELD_NAMES.to_vec()).prop_map(String::from),
        arb_field_value(),
        0..FIELD_NAMES.len(),
    )
}

fn snapshot_for(
    kind: EntityKind,
    id: String,
) -> impl Strategy<Value = EntitySnapshot> {
    (arb_fields(), 0u64..50, 0u64..1_000, prop::bool::weighted(0.1)).prop_map(
        move |(fields, version, updated_at_ms, deleted)| EntitySnapshot {
            kind,
            id: id.clone(),
            version,
            updated_at_ms,
            deleted,
            fields,
        },
    )
}

/// Strategy for a snapshot of any entity.
pub fn arb_snapshot() -> impl Strategy<Value = EntitySnapshot> {
    (arb_entity_kind(), arb_entity_id()).prop_flat_map(|(kind, id)| snapshot_for(kind, id))
}

/// Strategy for a local and a remote snapshot of the same entity.
pub fn arb_conflicting_pair() -> impl Strategy<Value = (EntitySnapshot, EntitySnapshot)> {
    (arb_entity_kind(), arb_entity_id()).prop_flat_map(|(kind, id)| {
        (snapshot_for(kind, id.clone()), snapshot_for(kind, id))
    })
}

/// Strategy for a common ancestor with a local and a remote descendant.
pub fn arb_diverged_triple(
) -> impl Strategy<Value = (EntitySnapshot, EntitySnapshot, EntitySnapshot)> {
    (arb_entity_kind(), arb_entity_id()).prop_flat_map(|(kind, id)| {
        (
            snapshot_for(kind, id.clone()),
            snapshot_for(kind, id.clone()),
            snapshot_for(kind, id),
        )
    })
}

/// Strategy for a well-formed operation.
pub fn arb_operation() -> impl Strategy<Value = SyncOperation> {
    (
        arb_snapshot(),
        prop::sample::select(vec![
            OperationType::Create,
            OperationType::Update,
            OperationType::Delete,
        ]),
        arb_priority(),
    )
        .prop_map(|(snapshot, op_type, priority)| {
            let op = match op_type {
                OperationType::Create => SyncOperation::create(snapshot),
                OperationType::Update => SyncOperation::update(snapshot),
                OperationType::Delete => SyncOperation::delete(snapshot.kind, snapshot.id),
            };
            op.with_priority(priority)
        })
}

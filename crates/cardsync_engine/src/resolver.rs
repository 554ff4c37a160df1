//! The Conflict Resolver: policy evaluation and field-level merge.
//!
//! The merge is three-way: each side is compared with the value both
//! sides last agreed on, so an edit made on one side only always
//! survives. Only fields changed on both sides need a tie-break.

use cardsync_protocol::{ConflictPolicy, EntitySnapshot, Resolution, SyncConflict};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Output of [`resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedValue {
    /// How the conflict was settled; [`Resolution::Pending`] for `manual`.
    pub resolution: Resolution,
    /// The winning value, absent while pending.
    pub value: Option<EntitySnapshot>,
}

impl ResolvedValue {
    fn pending() -> Self {
        Self {
            resolution: Resolution::Pending,
            value: None,
        }
    }

    fn settled(resolution: Resolution, value: EntitySnapshot) -> Self {
        Self {
            resolution,
            value: Some(value),
        }
    }

    /// Returns true if the policy deferred the decision.
    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::Pending
    }
}

/// Applies `policy` to a conflict.
///
/// Pure: writing the value back and propagating it is the orchestrator's job.
pub fn resolve(conflict: &SyncConflict, policy: ConflictPolicy) -> ResolvedValue {
    let local = &conflict.local_snapshot;
    let remote = &conflict.remote_snapshot;
    match policy {
        ConflictPolicy::RemoteWins => {
            ResolvedValue::settled(Resolution::RemoteWins, remote.clone())
        }
        ConflictPolicy::LocalWins => ResolvedValue::settled(Resolution::LocalWins, local.clone()),
        ConflictPolicy::NewestWins => {
            if local_is_newer(local, remote) {
                ResolvedValue::settled(Resolution::LocalWins, local.clone())
            } else {
                ResolvedValue::settled(Resolution::RemoteWins, remote.clone())
            }
        }
        ConflictPolicy::Merge => ResolvedValue::settled(
            Resolution::Merged,
            merge(conflict.base_snapshot.as_ref(), local, remote),
        ),
        ConflictPolicy::Manual => ResolvedValue::pending(),
    }
}

/// Returns the value a user's side choice stands for.
///
/// `None` for [`Resolution::Pending`] and [`Resolution::Manual`], which
/// carry no implied value.
pub fn value_for(conflict: &SyncConflict, resolution: Resolution) -> Option<EntitySnapshot> {
    match resolution {
        Resolution::LocalWins => Some(conflict.local_snapshot.clone()),
        Resolution::RemoteWins => Some(conflict.remote_snapshot.clone()),
        Resolution::Merged => Some(merge(
            conflict.base_snapshot.as_ref(),
            &conflict.local_snapshot,
            &conflict.remote_snapshot,
        )),
        Resolution::Pending | Resolution::Manual => None,
    }
}

// Strictly newer: the remote wins an exact tie.
fn local_is_newer(local: &EntitySnapshot, remote: &EntitySnapshot) -> bool {
    local.updated_at_ms > remote.updated_at_ms
}

/// Three-way field-level merge of two snapshots of the same entity.
///
/// `base` is the value both sides last agreed on; `None` stands for an
/// empty ancestor, as for two independent creates. Per field:
///
/// - a field only one side changed takes that side's value, removal included
/// - arrays changed on both sides keep every element added on either side
///   and drop every element removed on either side, sorted and deduplicated
/// - objects changed on both sides are merged key by key with these rules
/// - any other field changed on both sides goes to the newer snapshot,
///   remote on a tie
///
/// The result carries the higher version and timestamp and is deleted
/// only if both sides are. `merge(b, m, m) == m` for every `m`.
pub fn merge(
    base: Option<&EntitySnapshot>,
    local: &EntitySnapshot,
    remote: &EntitySnapshot,
) -> EntitySnapshot {
    let prefer_local = local_is_newer(local, remote);
    let no_fields = BTreeMap::new();
    let base_fields = base.map_or(&no_fields, |base| &base.fields);

    let names: BTreeSet<&String> = base_fields
        .keys()
        .chain(local.fields.keys())
        .chain(remote.fields.keys())
        .collect();
    let mut fields = BTreeMap::new();
    for name in names {
        let merged = merge_slot(
            base_fields.get(name),
            local.fields.get(name),
            remote.fields.get(name),
            prefer_local,
        );
        if let Some(value) = merged {
            fields.insert(name.clone(), value);
        }
    }

    EntitySnapshot {
        kind: remote.kind,
        id: remote.id.clone(),
        version: local.version.max(remote.version),
        updated_at_ms: local.updated_at_ms.max(remote.updated_at_ms),
        deleted: local.deleted && remote.deleted,
        fields,
    }
}

// `None` is an absent field on that side.
fn merge_slot(
    base: Option<&Value>,
    local: Option<&Value>,
    remote: Option<&Value>,
    prefer_local: bool,
) -> Option<Value> {
    if local == remote || remote == base {
        return local.cloned();
    }
    if local == base {
        return remote.cloned();
    }
    match (local, remote) {
        (Some(Value::Array(l)), Some(Value::Array(r))) => Some(merge_arrays(base, l, r)),
        (Some(Value::Object(l)), Some(Value::Object(r))) => {
            Some(merge_objects(base, l, r, prefer_local))
        }
        _ if prefer_local => local.cloned(),
        _ => remote.cloned(),
    }
}

fn merge_arrays(base: Option<&Value>, local: &[Value], remote: &[Value]) -> Value {
    let base = match base {
        Some(Value::Array(values)) => keys(values),
        _ => BTreeSet::new(),
    };
    let (in_local, in_remote) = (keys(local), keys(remote));

    let mut kept: BTreeMap<String, Value> = BTreeMap::new();
    for value in remote.iter().chain(local) {
        let key = value.to_string();
        let kept_by_both = in_local.contains(&key) && in_remote.contains(&key);
        if kept_by_both || !base.contains(&key) {
            kept.entry(key).or_insert_with(|| value.clone());
        }
    }
    Value::Array(kept.into_values().collect())
}

fn keys(values: &[Value]) -> BTreeSet<String> {
    values.iter().map(Value::to_string).collect()
}

fn merge_objects(
    base: Option<&Value>,
    local: &Map<String, Value>,
    remote: &Map<String, Value>,
    prefer_local: bool,
) -> Value {
    let no_keys = Map::new();
    let base = match base {
        Some(Value::Object(map)) => map,
        _ => &no_keys,
    };
    let names: BTreeSet<&String> = base.keys().chain(local.keys()).chain(remote.keys()).collect();

    let mut merged = Map::new();
    for key in names {
        if let Some(value) = merge_slot(base.get(key), local.get(key), remote.get(key), prefer_local)
        {
            merged.insert(key.clone(), value);
        }
    }
    Value::Object(merged)
}

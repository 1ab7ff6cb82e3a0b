//! A deterministic field-level delta CRDT engine.
//!
//! [`DeltaEngine`] implements the [`CrdtEngine`] boundary with the smallest
//! merge semantics that still exercise the reconciliation layer honestly:
//! every mutation is recorded as per-field delta changes stamped with a
//! lamport counter and an actor ID, and merging is a union of changes folded
//! in total order.
//!
//! Ordering rules (total across all actors):
//! 1. Higher counter wins
//! 2. If counters are equal, lexicographically higher actor ID wins
//! 3. Remaining ties broken by change ID
//!
//! The union-then-fold merge is commutative, associative and idempotent, and
//! edits to distinct fields never shadow each other, so concurrent replicas
//! converge without losing independent updates.
//!
//! Domain values are expected to be JSON objects; non-object values fall back
//! to whole-value last-writer-wins.

use concord_core::{ChangeLog, CrdtEngine, DocState, Error, ObjectId, Result, TypeTag};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;

/// One recorded edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Change {
    /// Globally unique change identity; merge dedups on it
    id: String,
    /// Lamport counter at the time of the edit
    counter: u64,
    /// Actor that produced the edit
    actor: String,
    /// Edited top-level field; `None` replaces the whole value
    #[serde(default)]
    field: Option<String>,
    /// New field value (ignored for removals)
    #[serde(default)]
    value: Value,
    /// Whether the field was removed
    #[serde(default)]
    remove: bool,
}

/// Field-level last-writer-wins delta engine.
#[derive(Debug, Clone)]
pub struct DeltaEngine {
    actor: String,
}

impl DeltaEngine {
    /// Create an engine with a random actor ID.
    pub fn new() -> Self {
        Self {
            actor: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// Create an engine with a fixed actor ID (deterministic tests).
    pub fn with_actor(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
        }
    }

    /// This engine's actor ID.
    pub fn actor(&self) -> &str {
        &self.actor
    }

    fn next_change_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Per-field deltas taking `old` to `new`, all stamped with `counter`.
    fn diff(&self, old: &Value, new: &Value, counter: u64) -> Vec<Change> {
        let (Some(old_map), Some(new_map)) = (old.as_object(), new.as_object()) else {
            // Non-object values merge whole-value LWW.
            if old == new {
                return Vec::new();
            }
            return vec![Change {
                id: self.next_change_id(),
                counter,
                actor: self.actor.clone(),
                field: None,
                value: new.clone(),
                remove: false,
            }];
        };

        let mut changes = Vec::new();
        for (field, value) in new_map {
            if old_map.get(field) != Some(value) {
                changes.push(Change {
                    id: self.next_change_id(),
                    counter,
                    actor: self.actor.clone(),
                    field: Some(field.clone()),
                    value: value.clone(),
                    remove: false,
                });
            }
        }
        for field in old_map.keys() {
            if !new_map.contains_key(field) {
                changes.push(Change {
                    id: self.next_change_id(),
                    counter,
                    actor: self.actor.clone(),
                    field: Some(field.clone()),
                    value: Value::Null,
                    remove: true,
                });
            }
        }
        changes
    }
}

impl Default for DeltaEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Highest counter present in a parsed change set.
fn max_counter(changes: &[Change]) -> u64 {
    changes.iter().map(|c| c.counter).max().unwrap_or(0)
}

fn parse_changes(raw: &[Value]) -> Result<Vec<Change>> {
    raw.iter()
        .map(|entry| {
            serde_json::from_value(entry.clone())
                .map_err(|err| Error::InvalidChangeLog(err.to_string()))
        })
        .collect()
}

fn encode_changes(changes: &[Change]) -> Result<Vec<Value>> {
    changes
        .iter()
        .map(|change| {
            serde_json::to_value(change).map_err(|err| Error::InvalidChangeLog(err.to_string()))
        })
        .collect()
}

/// Fold changes (already in total order) into a domain value.
fn fold(changes: &[Change]) -> Value {
    let mut value = Value::Null;
    for change in changes {
        match &change.field {
            None => value = change.value.clone(),
            Some(field) => {
                if !value.is_object() {
                    value = json!({});
                }
                let map = value.as_object_mut().expect("value coerced to object");
                if change.remove {
                    map.remove(field);
                } else {
                    map.insert(field.clone(), change.value.clone());
                }
            }
        }
    }
    value
}

fn sort_changes(changes: &mut [Change]) {
    changes.sort_by(|a, b| {
        (a.counter, &a.actor, &a.id).cmp(&(b.counter, &b.actor, &b.id))
    });
}

impl CrdtEngine for DeltaEngine {
    fn from_value(&self, object_id: ObjectId, type_tag: TypeTag, value: Value) -> DocState {
        let genesis = Change {
            id: self.next_change_id(),
            counter: 1,
            actor: self.actor.clone(),
            field: None,
            value: value.clone(),
            remove: false,
        };
        DocState {
            object_id,
            type_tag,
            value,
            changes: vec![serde_json::to_value(&genesis).expect("change serializes")],
        }
    }

    fn changes_since(&self, base: &DocState, state: &DocState) -> ChangeLog {
        debug_assert!(base.is_origin(), "only full logs from origin are supported");
        ChangeLog {
            object_id: state.object_id.clone(),
            type_tag: state.type_tag.clone(),
            changes: state.changes.clone(),
        }
    }

    fn apply(&self, state: DocState, log: &ChangeLog) -> Result<DocState> {
        let (object_id, type_tag) = if state.is_origin() {
            (log.object_id.clone(), log.type_tag.clone())
        } else if !log.object_id.is_empty() && log.object_id != state.object_id {
            return Err(Error::InvalidChangeLog(format!(
                "log for object {} applied to object {}",
                log.object_id, state.object_id
            )));
        } else {
            (state.object_id.clone(), state.type_tag.clone())
        };

        // Union by change ID, then fold in total order.
        let mut seen = HashSet::new();
        let mut changes = Vec::new();
        for change in parse_changes(&state.changes)?
            .into_iter()
            .chain(parse_changes(&log.changes)?)
        {
            if seen.insert(change.id.clone()) {
                changes.push(change);
            }
        }
        sort_changes(&mut changes);

        Ok(DocState {
            object_id,
            type_tag,
            value: fold(&changes),
            changes: encode_changes(&changes)?,
        })
    }

    fn mutate(&self, state: DocState, edit: &mut dyn FnMut(&mut Value)) -> DocState {
        let mut edited = if state.value.is_null() {
            json!({})
        } else {
            state.value.clone()
        };
        edit(&mut edited);

        let existing = match parse_changes(&state.changes) {
            Ok(changes) => changes,
            // A state this engine produced always parses; an unparseable one
            // cannot be extended coherently, so the edit is discarded.
            Err(err) => {
                tracing::warn!(object_id = %state.object_id, %err, "dropping edit: change log does not parse");
                return state;
            }
        };
        let deltas = self.diff(&state.value, &edited, max_counter(&existing) + 1);
        if deltas.is_empty() {
            return state;
        }

        let mut changes = existing;
        changes.extend(deltas);
        sort_changes(&mut changes);
        let value = fold(&changes);
        let encoded = encode_changes(&changes).expect("changes serialize");

        DocState {
            object_id: state.object_id,
            type_tag: state.type_tag,
            value,
            changes: encoded,
        }
    }
}

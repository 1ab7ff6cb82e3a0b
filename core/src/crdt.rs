//! The CRDT engine boundary.
//!
//! The reconciliation layer never merges edits itself. It owns an opaque
//! [`DocState`] snapshot and delegates every state transition to a
//! [`CrdtEngine`]: building a fresh state from an initial value, applying a
//! local edit, extracting the full change-log for persistence, and folding a
//! fetched change-log into the current state.
//!
//! The engine's merge operator must be commutative, associative and
//! idempotent so that the order in which conflicting revisions are folded in
//! does not matter and re-applying an already-seen log is harmless.

use crate::{error::Result, ObjectId, TypeTag};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serialized edit history from the engine's origin state.
///
/// This is what gets persisted as the document body in the replicated store:
/// never the raw domain value, always the full history sufficient to
/// reconstruct it. The individual change entries are produced and consumed by
/// the engine; the core treats them as opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLog {
    /// Object the log belongs to
    pub object_id: ObjectId,
    /// Concrete type of the object
    pub type_tag: TypeTag,
    /// Ordered, engine-defined change records
    pub changes: Vec<Value>,
}

impl ChangeLog {
    /// Number of change entries in the log.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether the log carries no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// An immutable snapshot of one object's merged state.
///
/// Replaced wholesale on every transition, never mutated in place. Carries
/// the identity pair, the current domain value view, and the engine's full
/// change history from origin (so the canonical log can always be recomputed
/// without re-reading the store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocState {
    /// Object identity, stable across replicas
    pub object_id: ObjectId,
    /// Concrete type of the object
    pub type_tag: TypeTag,
    /// Current merged domain value
    pub value: Value,
    /// Full change history from the engine's origin state
    pub changes: Vec<Value>,
}

impl DocState {
    /// The empty baseline every change-log is rooted at.
    pub fn origin() -> Self {
        Self {
            object_id: ObjectId::new(),
            type_tag: TypeTag::new(),
            value: Value::Null,
            changes: Vec::new(),
        }
    }

    /// Whether this is the empty origin state.
    pub fn is_origin(&self) -> bool {
        self.object_id.is_empty() && self.changes.is_empty()
    }
}

/// A mergeable-document engine.
///
/// Implementations define the change representation and the merge semantics;
/// the reconciliation layer only routes states and logs between the engine
/// and the store.
pub trait CrdtEngine: Send + Sync {
    /// The empty baseline state.
    fn origin(&self) -> DocState {
        DocState::origin()
    }

    /// Build a fresh state wrapping an initial domain value.
    fn from_value(&self, object_id: ObjectId, type_tag: TypeTag, value: Value) -> DocState;

    /// Extract the change-log that takes `base` to `state`.
    ///
    /// Called by the core exclusively with `base = origin()`, producing the
    /// full canonical log for persistence.
    fn changes_since(&self, base: &DocState, state: &DocState) -> ChangeLog;

    /// Fold a change-log into a state.
    ///
    /// Must be commutative and associative across logs for the same object,
    /// and idempotent for entries already present in `state`. Fails only on
    /// malformed entries or a log addressed to a different object.
    fn apply(&self, state: DocState, log: &ChangeLog) -> Result<DocState>;

    /// Apply a local edit to the domain value, producing the next state.
    fn mutate(&self, state: DocState, edit: &mut dyn FnMut(&mut Value)) -> DocState;
}

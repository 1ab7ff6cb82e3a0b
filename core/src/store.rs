//! The replicated store boundary.
//!
//! A [`ReplicatedStore`] is a document database with optimistic revisioning
//! and live bidirectional sync: every write is stamped with a new revision
//! token, concurrent writes to the same document surface as enumerable
//! conflict revisions, and every settled write (local or remote) is announced
//! on a broadcast change feed.
//!
//! Replication, retry and transport are entirely the store's concern; the
//! reconciliation layer only consumes this interface.

use crate::{crdt::ChangeLog, error::Result, ObjectId, RevisionToken};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A stored document: one object's full change-log plus revision metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Object the document belongs to
    pub id: ObjectId,
    /// Revision this write supersedes (`None` for a first write); on a
    /// fetched document, the revision that was read
    pub rev: Option<RevisionToken>,
    /// The full change-log from the engine's origin state
    pub body: ChangeLog,
    /// Alternate revisions written concurrently against this document.
    /// Populated only when requested via [`GetOptions::conflicts`]; empty in
    /// steady state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<RevisionToken>,
}

impl Document {
    /// Build a document for writing.
    pub fn new(id: impl Into<ObjectId>, rev: Option<RevisionToken>, body: ChangeLog) -> Self {
        Self {
            id: id.into(),
            rev,
            body,
            conflicts: Vec::new(),
        }
    }
}

/// Options for fetching a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Enumerate conflicting revisions alongside the winner.
    pub conflicts: bool,
    /// Fetch a specific revision instead of the current winner.
    pub rev: Option<RevisionToken>,
}

impl GetOptions {
    /// Fetch the winner together with its conflict set.
    pub fn with_conflicts() -> Self {
        Self {
            conflicts: true,
            rev: None,
        }
    }

    /// Fetch one specific revision.
    pub fn at_rev(rev: impl Into<RevisionToken>) -> Self {
        Self {
            conflicts: false,
            rev: Some(rev.into()),
        }
    }
}

/// A settled write somewhere in the replication topology.
///
/// Delivered for locally-originated writes as well as remote ones; consumers
/// treat both identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Object whose document changed
    pub id: ObjectId,
}

/// A replicated document store with optimistic revisioning.
#[async_trait]
pub trait ReplicatedStore: Send + Sync {
    /// Fetch a document. Fails with [`Error::NotFound`](crate::Error::NotFound)
    /// if the object has no document (or the requested revision is gone).
    async fn get(&self, id: &ObjectId, options: GetOptions) -> Result<Document>;

    /// Write a document, checked against `doc.rev` for optimistic
    /// concurrency. Returns the newly assigned revision token.
    async fn put(&self, doc: Document) -> Result<RevisionToken>;

    /// Delete the revision `rev` of `id`'s document.
    async fn remove(&self, id: &ObjectId, rev: &RevisionToken) -> Result<()>;

    /// Subscribe to the live change feed.
    ///
    /// The feed is indefinite and delivers an event per settled write,
    /// locally- and remotely-originated alike. A closed feed means the
    /// store itself shut down.
    fn changes(&self) -> broadcast::Receiver<ChangeEvent>;
}

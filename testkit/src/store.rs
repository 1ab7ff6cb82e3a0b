//! An in-memory replicated store with couch-flavored revision semantics.
//!
//! [`MemoryStore`] implements the [`ReplicatedStore`] boundary the way a
//! couch-style document database behaves at it: generation-prefixed revision
//! tokens (`"3-ab12cd34"`), optimistic writes checked against the current
//! token, conflicting revisions kept as enumerable siblings, rev-addressed
//! reads, and a broadcast change feed announcing every settled write.
//!
//! Divergent replicas are simulated with [`MemoryStore::put_replicated`],
//! the replication path: it bypasses the optimistic check and parks the
//! incoming document as a conflict sibling, exactly what a real replicator
//! does when two replicas wrote the same document independently.
//!
//! [`FlakyStore`] wraps any store and fails a scripted number of calls, for
//! exercising partial-failure handling.

use async_trait::async_trait;
use concord_core::{
    ChangeEvent, Document, Error, GetOptions, ObjectId, ReplicatedStore, Result, RevisionToken,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct StoredRev {
    rev: RevisionToken,
    body: concord_core::ChangeLog,
}

#[derive(Debug)]
struct Versions {
    winner: StoredRev,
    conflicts: Vec<StoredRev>,
}

/// In-memory document store with optimistic revisioning and a live feed.
#[derive(Debug)]
pub struct MemoryStore {
    docs: Mutex<HashMap<ObjectId, Versions>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            docs: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Replication-path write: park `doc` as a conflict sibling instead of
    /// checking its revision token (the store-level equivalent of a couch
    /// `new_edits=false` write). Becomes the winner if the document does not
    /// exist yet. Returns the stored revision token.
    pub fn put_replicated(&self, doc: Document) -> RevisionToken {
        let rev = {
            let mut docs = self.docs.lock().unwrap();
            match docs.get_mut(&doc.id) {
                None => {
                    let rev = doc.rev.unwrap_or_else(|| next_rev(None));
                    docs.insert(
                        doc.id.clone(),
                        Versions {
                            winner: StoredRev {
                                rev: rev.clone(),
                                body: doc.body,
                            },
                            conflicts: Vec::new(),
                        },
                    );
                    rev
                }
                Some(versions) => {
                    let rev = doc
                        .rev
                        .unwrap_or_else(|| next_rev(Some(&versions.winner.rev)));
                    versions.conflicts.push(StoredRev {
                        rev: rev.clone(),
                        body: doc.body,
                    });
                    rev
                }
            }
        };
        let _ = self.events.send(ChangeEvent { id: doc.id });
        rev
    }

    /// Whether a document exists for `id`.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.docs.lock().unwrap().contains_key(id)
    }

    /// Number of conflict siblings currently parked for `id`.
    pub fn conflict_count(&self, id: &ObjectId) -> usize {
        self.docs
            .lock()
            .unwrap()
            .get(id)
            .map(|versions| versions.conflicts.len())
            .unwrap_or(0)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    /// Whether the store holds no documents.
    pub fn is_empty(&self) -> bool {
        self.docs.lock().unwrap().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Mint the next revision token: bump the generation, fresh hash suffix.
fn next_rev(prev: Option<&RevisionToken>) -> RevisionToken {
    let generation = prev
        .and_then(|rev| rev.split('-').next())
        .and_then(|gen| gen.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", generation, &suffix[..8])
}

#[async_trait]
impl ReplicatedStore for MemoryStore {
    async fn get(&self, id: &ObjectId, options: GetOptions) -> Result<Document> {
        let docs = self.docs.lock().unwrap();
        let versions = docs.get(id).ok_or_else(|| Error::NotFound(id.clone()))?;

        if let Some(rev) = &options.rev {
            let stored = if versions.winner.rev == *rev {
                &versions.winner
            } else {
                versions
                    .conflicts
                    .iter()
                    .find(|sibling| sibling.rev == *rev)
                    .ok_or_else(|| Error::NotFound(id.clone()))?
            };
            return Ok(Document {
                id: id.clone(),
                rev: Some(stored.rev.clone()),
                body: stored.body.clone(),
                conflicts: Vec::new(),
            });
        }

        let conflicts = if options.conflicts {
            versions
                .conflicts
                .iter()
                .map(|sibling| sibling.rev.clone())
                .collect()
        } else {
            Vec::new()
        };
        Ok(Document {
            id: id.clone(),
            rev: Some(versions.winner.rev.clone()),
            body: versions.winner.body.clone(),
            conflicts,
        })
    }

    async fn put(&self, doc: Document) -> Result<RevisionToken> {
        let rev = {
            let mut docs = self.docs.lock().unwrap();
            match docs.get_mut(&doc.id) {
                None => {
                    if doc.rev.is_some() {
                        return Err(Error::RevisionConflict(doc.id));
                    }
                    let rev = next_rev(None);
                    docs.insert(
                        doc.id.clone(),
                        Versions {
                            winner: StoredRev {
                                rev: rev.clone(),
                                body: doc.body,
                            },
                            conflicts: Vec::new(),
                        },
                    );
                    rev
                }
                Some(versions) => match &doc.rev {
                    Some(rev) if *rev == versions.winner.rev => {
                        let next = next_rev(Some(rev));
                        versions.winner = StoredRev {
                            rev: next.clone(),
                            body: doc.body,
                        };
                        next
                    }
                    Some(rev) => {
                        let Some(sibling) = versions
                            .conflicts
                            .iter_mut()
                            .find(|sibling| sibling.rev == *rev)
                        else {
                            return Err(Error::RevisionConflict(doc.id));
                        };
                        let next = next_rev(Some(rev));
                        *sibling = StoredRev {
                            rev: next.clone(),
                            body: doc.body,
                        };
                        next
                    }
                    None => return Err(Error::RevisionConflict(doc.id)),
                },
            }
        };
        let _ = self.events.send(ChangeEvent { id: doc.id });
        Ok(rev)
    }

    async fn remove(&self, id: &ObjectId, rev: &RevisionToken) -> Result<()> {
        {
            let mut docs = self.docs.lock().unwrap();
            let versions = docs.get_mut(id).ok_or_else(|| Error::NotFound(id.clone()))?;

            if versions.winner.rev == *rev {
                // Deleting the winner promotes a surviving sibling.
                match versions.conflicts.pop() {
                    Some(promoted) => versions.winner = promoted,
                    None => {
                        docs.remove(id);
                    }
                }
            } else if let Some(pos) = versions
                .conflicts
                .iter()
                .position(|sibling| sibling.rev == *rev)
            {
                versions.conflicts.remove(pos);
            } else {
                return Err(Error::RevisionConflict(id.clone()));
            }
        }
        let _ = self.events.send(ChangeEvent { id: id.clone() });
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

/// Store wrapper that fails a scripted number of upcoming calls.
#[derive(Debug)]
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failing_puts: AtomicU32,
    failing_gets: AtomicU32,
    failing_removes: AtomicU32,
}

impl FlakyStore {
    /// Wrap a store; no failures scripted yet.
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_puts: AtomicU32::new(0),
            failing_gets: AtomicU32::new(0),
            failing_removes: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` `put` calls with an I/O error.
    pub fn fail_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `get` calls with an I/O error.
    pub fn fail_gets(&self, n: u32) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `remove` calls with an I/O error.
    pub fn fail_removes(&self, n: u32) {
        self.failing_removes.store(n, Ordering::SeqCst);
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    fn should_fail(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ReplicatedStore for FlakyStore {
    async fn get(&self, id: &ObjectId, options: GetOptions) -> Result<Document> {
        if Self::should_fail(&self.failing_gets) {
            return Err(Error::Io("injected get failure".into()));
        }
        self.inner.get(id, options).await
    }

    async fn put(&self, doc: Document) -> Result<RevisionToken> {
        if Self::should_fail(&self.failing_puts) {
            return Err(Error::Io("injected put failure".into()));
        }
        self.inner.put(doc).await
    }

    async fn remove(&self, id: &ObjectId, rev: &RevisionToken) -> Result<()> {
        if Self::should_fail(&self.failing_removes) {
            return Err(Error::Io("injected remove failure".into()));
        }
        self.inner.remove(id, rev).await
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes()
    }
}

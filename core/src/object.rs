//! The per-object reconciliation state machine.
//!
//! A [`SyncedObject`] owns one CRDT-backed value, its current store revision
//! token, and a set of change observers. Local mutations go through the
//! engine and are persisted as the full change-log; change-feed events
//! trigger a reconciliation pass that re-fetches the document, folds every
//! conflicting revision into the state, deletes the superseded revisions,
//! writes the merged log back, and fires observers exactly once.
//!
//! # Lifecycle
//!
//! `Initializing -> Live -> (Reconciling)* -> Live -> Removed`
//!
//! Reconciling is transient: a failed pass logs, leaves the object live with
//! stale data, and is repeated on the next change event (or on the scheduled
//! retry for transient store failures). After [`SyncedObject::remove`] the
//! instance is inert and every operation fails with
//! [`Error::ObjectRemoved`].
//!
//! # Ordering
//!
//! One in-flight operation per object: `mutate`, `reconcile` and `remove`
//! all serialize on a per-object async gate, so a local edit can never
//! interleave with a concurrent merge on the same instance. Distinct objects
//! proceed fully in parallel.

use crate::{
    crdt::{CrdtEngine, DocState},
    error::{Error, Result},
    store::{ChangeEvent, Document, GetOptions, ReplicatedStore},
    workspace::Workspace,
    ObjectId, RevisionToken, TypeTag,
};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex as OpGate, Notify};

/// Delay before a failed reconciliation pass is re-enqueued.
pub const RETRY_DELAY: Duration = Duration::from_millis(250);

/// A registered change observer.
pub type Observer = Arc<dyn Fn() + Send + Sync>;

/// Resolve a dotted path (`"profile.address.city"`) inside a JSON value.
///
/// The empty path resolves to the value itself; any missing segment or
/// traversal through a non-object resolves to `None`.
pub fn descendant<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |acc, part| acc.get(part))
}

/// Identity handle for observer deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Inner {
    state: DocState,
    rev: Option<RevisionToken>,
}

/// One live, synchronized object.
///
/// Constructed through [`Workspace::create`] (fresh) or
/// [`Workspace::adopt`] (from a reconstructed state); at most one instance
/// per object ID is live in a process at a time.
pub struct SyncedObject {
    object_id: ObjectId,
    type_tag: TypeTag,
    store: Arc<dyn ReplicatedStore>,
    engine: Arc<dyn CrdtEngine>,
    workspace: Weak<Workspace>,
    inner: Mutex<Inner>,
    /// Serializes mutate/reconcile/remove for this object.
    op_gate: OpGate<()>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
    removed: AtomicBool,
    retry: Arc<Notify>,
}

impl SyncedObject {
    /// Construct and wire up an instance.
    ///
    /// `persist_first` distinguishes the fresh path (new state that must be
    /// written out immediately) from the adopt path (state reconstructed from
    /// an already-stored document). Both paths self-register in the live
    /// cache, run one eager fetch-merge pass, and start the change-feed
    /// listener. Registration collisions and eager-pass failures are
    /// non-fatal: they are logged and the instance stays usable.
    pub(crate) async fn start(
        workspace: &Arc<Workspace>,
        state: DocState,
        persist_first: bool,
    ) -> Arc<Self> {
        // Subscribe before the first write so its change event is not missed.
        let feed = workspace.store().changes();

        let object = Arc::new(Self {
            object_id: state.object_id.clone(),
            type_tag: state.type_tag.clone(),
            store: workspace.store().clone(),
            engine: workspace.engine().clone(),
            workspace: Arc::downgrade(workspace),
            inner: Mutex::new(Inner { state, rev: None }),
            op_gate: OpGate::new(()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(0),
            removed: AtomicBool::new(false),
            retry: Arc::new(Notify::new()),
        });

        if persist_first {
            let _gate = object.op_gate.lock().await;
            if let Err(err) = object.persist().await {
                tracing::warn!(id = %object.object_id, error = %err,
                    "initial persist failed; object stays local until the next sync settles");
            }
        }

        if let Err(Error::DuplicateObject(_)) = workspace
            .cache()
            .register(object.object_id.clone(), object.clone())
        {
            // Expected when construction was driven by the cache's own load
            // path, which re-enters here; the first instance stays.
            tracing::warn!(id = %object.object_id,
                "object already live in the cache; skipping registration");
        }

        match object.reconcile().await {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                // The just-written document may not be visible yet.
                tracing::debug!(id = %object.object_id, "no stored document yet; eager merge skipped");
            }
            Err(err) => {
                tracing::warn!(id = %object.object_id, error = %err, "eager fetch-merge failed");
            }
        }

        object.spawn_listener(feed);
        object
    }

    /// The object's stable identity.
    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    /// The object's concrete type tag.
    pub fn type_tag(&self) -> &TypeTag {
        &self.type_tag
    }

    /// Snapshot of the current domain value. Never touches the store.
    pub fn value(&self) -> Value {
        self.inner.lock().unwrap().state.value.clone()
    }

    /// Snapshot of the value at a dotted path inside the domain value.
    ///
    /// `value_at("")` is the whole value; see [`descendant`].
    pub fn value_at(&self, path: &str) -> Option<Value> {
        let inner = self.inner.lock().unwrap();
        descendant(&inner.state.value, path).cloned()
    }

    /// Snapshot of the full CRDT state.
    pub fn state(&self) -> DocState {
        self.inner.lock().unwrap().state.clone()
    }

    /// The revision token of the last settled write, if any.
    pub fn revision(&self) -> Option<RevisionToken> {
        self.inner.lock().unwrap().rev.clone()
    }

    /// Whether [`remove`](Self::remove) has been called.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Apply a local edit to the domain value and persist the result.
    ///
    /// The edit is visible in memory immediately; durability is fire and
    /// forget. A failed persist is logged and the stale revision token is
    /// kept, so the next write retries against the store's optimistic
    /// concurrency check.
    pub async fn mutate<F>(&self, mut edit: F) -> Result<()>
    where
        F: FnMut(&mut Value),
    {
        if self.is_removed() {
            return Err(Error::ObjectRemoved(self.object_id.clone()));
        }
        let _gate = self.op_gate.lock().await;

        {
            let mut inner = self.inner.lock().unwrap();
            let state = inner.state.clone();
            inner.state = self.engine.mutate(state, &mut edit);
        }

        if let Err(err) = self.persist().await {
            tracing::warn!(id = %self.object_id, error = %err,
                "persist failed; keeping in-memory state and stale revision token");
        }
        Ok(())
    }

    /// Deregister from the live cache and delete the stored document.
    ///
    /// Idempotent; after the first call the instance is inert.
    pub async fn remove(&self) -> Result<()> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _gate = self.op_gate.lock().await;

        if let Some(workspace) = self.workspace.upgrade() {
            workspace.cache().deregister(&self.object_id);
        }

        let rev = self.inner.lock().unwrap().rev.clone();
        match rev {
            Some(rev) => self.store.remove(&self.object_id, &rev).await,
            None => {
                tracing::warn!(id = %self.object_id, "removing an object that was never persisted");
                Ok(())
            }
        }
    }

    /// Register a change observer; fired after every completed
    /// reconciliation pass, once the state and revision token are settled.
    pub fn on_change<F>(&self, observer: F) -> ObserverId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap()
            .push((id, Arc::new(observer)));
        id
    }

    /// Deregister an observer. Unknown ids are ignored.
    pub fn off_change(&self, id: ObserverId) {
        self.observers.lock().unwrap().retain(|(oid, _)| *oid != id);
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    /// Run one reconciliation pass now.
    ///
    /// Normally driven by the store's change feed; exposed for callers that
    /// want to settle an object on demand. Fetches the document with its
    /// conflict set, folds the winner and every conflicting revision into the
    /// CRDT state (merge before delete, so a failed delete loses nothing),
    /// drains the conflict set all-or-nothing, writes the merged log back,
    /// and fires observers exactly once on completion.
    pub async fn reconcile(&self) -> Result<()> {
        if self.is_removed() {
            return Err(Error::ObjectRemoved(self.object_id.clone()));
        }
        let gate = self.op_gate.lock().await;

        let doc = self
            .store
            .get(&self.object_id, GetOptions::with_conflicts())
            .await?;

        // Fold the winning revision in first and adopt its token.
        {
            let mut inner = self.inner.lock().unwrap();
            let merged = self.engine.apply(inner.state.clone(), &doc.body)?;
            inner.state = merged;
            inner.rev = doc.rev.clone();
        }

        if !doc.conflicts.is_empty() {
            for rev in &doc.conflicts {
                let sibling = self
                    .store
                    .get(&self.object_id, GetOptions::at_rev(rev.clone()))
                    .await?;
                {
                    let mut inner = self.inner.lock().unwrap();
                    let merged = self.engine.apply(inner.state.clone(), &sibling.body)?;
                    inner.state = merged;
                }
                // Merge before delete: the edits survive even if this fails.
                self.store.remove(&self.object_id, rev).await?;
            }
            // All conflicts folded in; write the canonical merged log back.
            self.persist().await?;
        }

        drop(gate);
        self.notify_observers();
        Ok(())
    }

    /// Persist the full change-log at the current revision token, then
    /// re-fetch for the authoritative new token.
    async fn persist(&self) -> Result<()> {
        let doc = {
            let inner = self.inner.lock().unwrap();
            let log = self.engine.changes_since(&self.engine.origin(), &inner.state);
            Document::new(self.object_id.clone(), inner.rev.clone(), log)
        };
        self.store.put(doc).await?;

        let fetched = self.store.get(&self.object_id, GetOptions::default()).await?;
        self.inner.lock().unwrap().rev = fetched.rev;
        Ok(())
    }

    /// Invoke every observer registered at the start of the pass.
    ///
    /// Iterates over a snapshot: observers added or removed during the
    /// notification do not affect the in-progress pass.
    fn notify_observers(&self) {
        let snapshot: Vec<Observer> = {
            let observers = self.observers.lock().unwrap();
            observers.iter().map(|(_, f)| f.clone()).collect()
        };
        for observer in snapshot {
            observer();
        }
    }

    /// Re-enqueue a reconciliation pass after a short delay.
    ///
    /// Failures never recurse on the current stack; they wake the listener
    /// task through the notifier instead.
    fn schedule_retry(&self) {
        let retry = self.retry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RETRY_DELAY).await;
            retry.notify_one();
        });
    }

    /// Start the change-feed listener for this object.
    ///
    /// The task holds only a weak handle: dropping every strong reference
    /// ends the subscription.
    fn spawn_listener(self: &Arc<Self>, mut feed: broadcast::Receiver<ChangeEvent>) {
        let weak = Arc::downgrade(self);
        let object_id = self.object_id.clone();
        let retry = self.retry.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = feed.recv() => match event {
                        Ok(event) if event.id == object_id => {}
                        Ok(_) => continue,
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(id = %object_id, missed,
                                "change feed lagged; forcing a reconciliation pass");
                        }
                        Err(RecvError::Closed) => {
                            tracing::error!(id = %object_id,
                                "change feed closed; live sync subscription ended");
                            break;
                        }
                    },
                    _ = retry.notified() => {}
                }

                let Some(object) = weak.upgrade() else { break };
                if object.is_removed() {
                    break;
                }

                match object.reconcile().await {
                    Ok(()) => {}
                    Err(Error::ObjectRemoved(_)) => break,
                    Err(err) if err.is_retryable() => {
                        tracing::warn!(id = %object_id, error = %err,
                            "reconciliation failed; scheduling retry");
                        object.schedule_retry();
                    }
                    Err(err) => {
                        tracing::warn!(id = %object_id, error = %err,
                            "reconciliation failed; waiting for the next change event");
                    }
                }
            }
        });
    }
}

impl fmt::Debug for SyncedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedObject")
            .field("object_id", &self.object_id)
            .field("type_tag", &self.type_tag)
            .field("rev", &self.revision())
            .field("removed", &self.is_removed())
            .finish()
    }
}

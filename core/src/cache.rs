//! Live object cache: the single point of truth for which instances exist
//! in this process.
//!
//! At most one live instance per object ID. Instances self-register during
//! construction and stay until explicitly deregistered; there is no eviction.

use crate::{error::Result, object::SyncedObject, workspace::Workspace, Error, ObjectId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Process-wide map from object ID to its live instance.
///
/// Thread-safe; shared across handlers and the change-feed listener tasks.
#[derive(Default)]
pub struct LiveCache {
    objects: DashMap<ObjectId, Arc<SyncedObject>>,
}

impl LiveCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    /// Return the live instance for `id`, loading it through the workspace's
    /// type registry on a miss. The loaded instance registers itself during
    /// construction.
    pub async fn get(&self, workspace: &Arc<Workspace>, id: &ObjectId) -> Result<Arc<SyncedObject>> {
        if let Some(obj) = self.lookup(id) {
            return Ok(obj);
        }
        workspace.load_object(id).await
    }

    /// Return the cached instance for `id`, if any. Never loads.
    pub fn lookup(&self, id: &ObjectId) -> Option<Arc<SyncedObject>> {
        self.objects.get(id).map(|entry| entry.value().clone())
    }

    /// Register a live instance. Fails with [`Error::DuplicateObject`] if an
    /// entry already exists; the first registration stays.
    pub fn register(&self, id: impl Into<ObjectId>, object: Arc<SyncedObject>) -> Result<()> {
        let id = id.into();
        match self.objects.entry(id.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateObject(id)),
            Entry::Vacant(entry) => {
                entry.insert(object);
                Ok(())
            }
        }
    }

    /// Remove the entry for `id`. Idempotent; absent entries are fine.
    pub fn deregister(&self, id: &ObjectId) {
        self.objects.remove(id);
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether no instances are live.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

//! Type registry mapping type tags to constructor and loader functions.
//!
//! Stored documents carry only a generic object ID; the tag recorded in the
//! reconstructed state decides which registered loader rehydrates it into a
//! concrete typed object. Registration is last-wins: re-registering a tag
//! replaces both functions (unlike live-object registration, which refuses
//! duplicates).

use crate::{crdt::DocState, error::Result, object::SyncedObject, workspace::Workspace, TypeTag};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// Constructor for a fresh object of one type.
///
/// Receives the owning workspace and the caller's construction arguments,
/// settles with the live instance.
pub type CreateFn =
    Arc<dyn Fn(Arc<Workspace>, Value) -> BoxFuture<'static, Result<Arc<SyncedObject>>> + Send + Sync>;

/// Loader rehydrating an object from a reconstructed CRDT state.
pub type LoadFn =
    Arc<dyn Fn(Arc<Workspace>, DocState) -> BoxFuture<'static, Result<Arc<SyncedObject>>> + Send + Sync>;

struct TypeEntry {
    create: CreateFn,
    load: LoadFn,
}

/// Registry of constructors and loaders, keyed by type tag.
#[derive(Default)]
pub struct TypeRegistry {
    types: DashMap<TypeTag, TypeEntry>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            types: DashMap::new(),
        }
    }

    /// Register both functions for a type tag. Last registration wins.
    pub fn register(&self, tag: impl Into<TypeTag>, create: CreateFn, load: LoadFn) {
        self.types.insert(tag.into(), TypeEntry { create, load });
    }

    /// Look up the constructor for a tag.
    pub fn create_fn(&self, tag: &str) -> Result<CreateFn> {
        self.types
            .get(tag)
            .map(|entry| entry.create.clone())
            .ok_or_else(|| crate::Error::UnknownType(tag.to_string()))
    }

    /// Look up the loader for a tag.
    pub fn load_fn(&self, tag: &str) -> Result<LoadFn> {
        self.types
            .get(tag)
            .map(|entry| entry.load.clone())
            .ok_or_else(|| crate::Error::UnknownType(tag.to_string()))
    }

    /// Whether a tag has been registered.
    pub fn contains(&self, tag: &str) -> bool {
        self.types.contains_key(tag)
    }
}

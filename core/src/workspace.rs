//! The workspace: explicit container wiring the collaborators together.
//!
//! A [`Workspace`] bundles the replicated store, the CRDT engine, the type
//! registry and the live object cache behind one `Arc`, so tests and
//! applications can instantiate fully isolated stacks instead of sharing
//! process-wide singletons.

use crate::{
    cache::LiveCache,
    crdt::{CrdtEngine, DocState},
    error::Result,
    object::SyncedObject,
    registry::{CreateFn, LoadFn, TypeRegistry},
    store::{GetOptions, ReplicatedStore},
    ObjectId, TypeTag,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Shared state for one synchronized-object universe.
pub struct Workspace {
    store: Arc<dyn ReplicatedStore>,
    engine: Arc<dyn CrdtEngine>,
    registry: TypeRegistry,
    cache: LiveCache,
}

impl Workspace {
    /// Build a workspace around a store and an engine.
    pub fn new(store: Arc<dyn ReplicatedStore>, engine: Arc<dyn CrdtEngine>) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            registry: TypeRegistry::new(),
            cache: LiveCache::new(),
        })
    }

    /// The replicated store this workspace persists to.
    pub fn store(&self) -> &Arc<dyn ReplicatedStore> {
        &self.store
    }

    /// The CRDT engine this workspace merges with.
    pub fn engine(&self) -> &Arc<dyn CrdtEngine> {
        &self.engine
    }

    /// The live object cache.
    pub fn cache(&self) -> &LiveCache {
        &self.cache
    }

    /// The type registry.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Register constructor and loader functions for a type tag.
    ///
    /// Plain async closures work; boxing happens here. Last registration for
    /// a tag wins.
    pub fn register_type<C, CF, L, LF>(&self, tag: impl Into<TypeTag>, create: C, load: L)
    where
        C: Fn(Arc<Workspace>, Value) -> CF + Send + Sync + 'static,
        CF: Future<Output = Result<Arc<SyncedObject>>> + Send + 'static,
        L: Fn(Arc<Workspace>, DocState) -> LF + Send + Sync + 'static,
        LF: Future<Output = Result<Arc<SyncedObject>>> + Send + 'static,
    {
        let create: CreateFn = Arc::new(move |ws, args| Box::pin(create(ws, args)));
        let load: LoadFn = Arc::new(move |ws, state| Box::pin(load(ws, state)));
        self.registry.register(tag, create, load);
    }

    /// Construct a fresh object through the registered constructor for `tag`.
    pub async fn create_object(
        self: &Arc<Self>,
        tag: &str,
        args: Value,
    ) -> Result<Arc<SyncedObject>> {
        let create = self.registry.create_fn(tag)?;
        create(self.clone(), args).await
    }

    /// Load an object from its stored document.
    ///
    /// Fetches the change-log, reconstructs the CRDT state from the engine's
    /// origin, reads the type tag from the state, and hands off to the
    /// registered loader. Propagates `NotFound` from the store and
    /// `UnknownType` for unregistered tags.
    pub async fn load_object(self: &Arc<Self>, id: &ObjectId) -> Result<Arc<SyncedObject>> {
        let doc = self.store.get(id, GetOptions::default()).await?;
        let state = self.engine.apply(self.engine.origin(), &doc.body)?;
        let load = self.registry.load_fn(&state.type_tag)?;
        load(self.clone(), state).await
    }

    /// Return the live instance for `id`, loading it on a cache miss.
    pub async fn get_object(self: &Arc<Self>, id: &ObjectId) -> Result<Arc<SyncedObject>> {
        self.cache.get(self, id).await
    }

    /// Fresh construction path: wrap an initial value in a new CRDT state,
    /// persist it, and bring the instance live. Generates an object ID when
    /// none is supplied.
    pub async fn create(
        self: &Arc<Self>,
        tag: impl Into<TypeTag>,
        id: Option<ObjectId>,
        value: Value,
    ) -> Result<Arc<SyncedObject>> {
        let object_id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let state = self.engine.from_value(object_id, tag.into(), value);
        Ok(SyncedObject::start(self, state, true).await)
    }

    /// From-state construction path: adopt an already-reconstructed CRDT
    /// state without re-persisting it. This is what registered loaders
    /// typically call.
    pub async fn adopt(self: &Arc<Self>, state: DocState) -> Result<Arc<SyncedObject>> {
        Ok(SyncedObject::start(self, state, false).await)
    }
}

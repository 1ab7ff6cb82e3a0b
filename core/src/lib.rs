//! # Concord Core
//!
//! The reconciliation layer that keeps typed, locally-mutable objects
//! synchronized across replicas through a replicated document store and a
//! mergeable CRDT engine.
//!
//! Both collaborators are injected behind traits and stay opaque:
//!
//! - The [`ReplicatedStore`] is a document database with optimistic
//!   revisioning, conflict-revision enumeration, and a live change feed.
//!   Replication and transport live entirely behind it.
//! - The [`CrdtEngine`] turns change-logs into merged immutable snapshots.
//!   Its merge is commutative, associative and idempotent; this crate never
//!   merges edits itself.
//!
//! What this crate does own is the per-object protocol: applying local
//! mutations and persisting their change-logs, reacting to change events,
//! folding conflicting revisions into one CRDT state, pruning the superseded
//! revisions, and notifying observers once per settled state.
//!
//! ## Design principles
//!
//! - **Eventually durable**: mutations are visible in memory immediately;
//!   persistence is fire and forget with retry on later sync activity.
//! - **Lossless merges**: a fetched change-log is always merged before the
//!   revision carrying it is deleted, so partial failures drop no edits.
//! - **One writer per object**: mutation and reconciliation serialize on a
//!   per-object gate; distinct objects proceed in parallel.
//! - **No singletons**: store, engine, registry and cache are bundled in an
//!   explicit [`Workspace`] so every test gets an isolated universe.
//!
//! ## Quick start
//!
//! ```no_run
//! use concord_core::Workspace;
//! use concord_testkit::{DeltaEngine, MemoryStore};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workspace = Workspace::new(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(DeltaEngine::new()),
//!     );
//!
//!     // Register a type: how to build one fresh, how to rehydrate one.
//!     workspace.register_type(
//!         "Note",
//!         |ws, args| async move { ws.create("Note", None, args).await },
//!         |ws, state| async move { ws.adopt(state).await },
//!     );
//!
//!     let note = workspace
//!         .create_object("Note", json!({ "title": "groceries", "done": false }))
//!         .await?;
//!
//!     // Local edits apply immediately; durability settles in the background.
//!     note.mutate(|value| value["done"] = json!(true)).await?;
//!     assert_eq!(note.value()["done"], json!(true));
//!
//!     // React to remote settlement.
//!     let watch = note.on_change(|| println!("note changed"));
//!     note.off_change(watch);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod crdt;
pub mod error;
pub mod object;
pub mod registry;
pub mod store;
pub mod workspace;

// Re-export main types at crate root
pub use cache::LiveCache;
pub use crdt::{ChangeLog, CrdtEngine, DocState};
pub use error::{Error, Result};
pub use object::{descendant, Observer, ObserverId, SyncedObject, RETRY_DELAY};
pub use registry::{CreateFn, LoadFn, TypeRegistry};
pub use store::{ChangeEvent, Document, GetOptions, ReplicatedStore};
pub use workspace::Workspace;

// Type aliases for clarity
/// Opaque unique identifier of one logical object across all replicas.
pub type ObjectId = String;
/// Name selecting the concrete object variant in the type registry.
pub type TypeTag = String;
/// Store-assigned version stamp for optimistic concurrency.
pub type RevisionToken = String;

//! # Concord Testkit
//!
//! Concrete, in-memory implementations of the Concord collaborator
//! boundaries, for tests and examples:
//!
//! - [`MemoryStore`]: a couch-flavored document store with optimistic
//!   revision tokens, conflict siblings, rev-addressed reads and a live
//!   broadcast change feed. `put_replicated` simulates the replication path
//!   that parks divergent writes as conflicts.
//! - [`FlakyStore`]: wraps a store and fails a scripted number of calls, for
//!   exercising partial-failure behavior.
//! - [`DeltaEngine`]: a deterministic field-level last-writer-wins delta
//!   CRDT, small enough to reason about and lossless for edits to distinct
//!   fields.
//!
//! Everything here is real enough to exercise the reconciliation protocol
//! end to end in-process, with no I/O beyond tokio channels.

pub mod engine;
pub mod store;

pub use engine::DeltaEngine;
pub use store::{FlakyStore, MemoryStore};

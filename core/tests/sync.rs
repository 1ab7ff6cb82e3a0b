//! End-to-end tests for the reconciliation protocol.
//!
//! These run the real protocol against the in-memory collaborators: a
//! couch-flavored store with conflict siblings and a field-level delta CRDT
//! engine. Tests needing background settlement await with a timeout; the
//! rest drive reconciliation passes directly for determinism.

use concord_core::{CrdtEngine, Document, Error, GetOptions, ObjectId, ReplicatedStore, Workspace};
use concord_testkit::{DeltaEngine, FlakyStore, MemoryStore};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn register_test_type(workspace: &Arc<Workspace>) {
    workspace.register_type(
        "Test",
        |ws, args| async move { ws.create("Test", None, args).await },
        |ws, state| async move { ws.adopt(state).await },
    );
}

fn test_workspace() -> (Arc<Workspace>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let workspace = Workspace::new(store.clone(), Arc::new(DeltaEngine::new()));
    register_test_type(&workspace);
    (workspace, store)
}

/// Another workspace sharing the same store, as a second process would.
fn attach_workspace(store: &Arc<MemoryStore>) -> Arc<Workspace> {
    let workspace = Workspace::new(store.clone(), Arc::new(DeltaEngine::new()));
    register_test_type(&workspace);
    workspace
}

/// Park a divergent replica write for `id`: take the stored log, extend it
/// with an edit made by an independent actor, and push it down the
/// replication path so it lands as a conflict sibling.
async fn inject_replica_edit(
    store: &Arc<MemoryStore>,
    id: &ObjectId,
    actor: &str,
    edit: impl FnMut(&mut serde_json::Value),
) {
    let engine = DeltaEngine::with_actor(actor);
    let doc = store.get(id, GetOptions::default()).await.unwrap();
    let state = engine.apply(engine.origin(), &doc.body).unwrap();
    let mut edit = edit;
    let state = engine.mutate(state, &mut edit);
    let body = engine.changes_since(&engine.origin(), &state);
    store.put_replicated(Document::new(id.clone(), None, body));
}

// ============================================================================
// Local mutation
// ============================================================================

#[tokio::test]
async fn local_mutate_is_visible_immediately() {
    let (workspace, store) = test_workspace();

    let obj = workspace
        .create_object("Test", json!({ "flag": false }))
        .await
        .unwrap();
    assert_eq!(obj.value()["flag"], json!(false));
    assert_eq!(obj.type_tag(), "Test");
    assert!(store.contains(obj.object_id()));

    obj.mutate(|value| value["flag"] = json!(true)).await.unwrap();
    assert_eq!(obj.value()["flag"], json!(true));
    assert_eq!(obj.value_at("flag"), Some(json!(true)));
    assert_eq!(obj.value_at("missing.path"), None);
}

#[tokio::test]
async fn failed_persist_keeps_state_and_loses_nothing() {
    let mem = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(mem.clone()));
    let workspace = Workspace::new(flaky.clone(), Arc::new(DeltaEngine::new()));
    register_test_type(&workspace);

    let obj = workspace
        .create("Test", Some("obj-1".into()), json!({ "a": 1 }))
        .await
        .unwrap();
    let rev_before = obj.revision();

    flaky.fail_puts(1);
    obj.mutate(|value| value["b"] = json!(2)).await.unwrap();

    // In-memory state advanced; the store and token did not.
    assert_eq!(obj.value(), json!({ "a": 1, "b": 2 }));
    assert_eq!(obj.revision(), rev_before);

    // The next write carries the full log, so the failed edit still lands.
    obj.mutate(|value| value["c"] = json!(3)).await.unwrap();
    let loaded = attach_workspace(&mem)
        .load_object(&"obj-1".to_string())
        .await
        .unwrap();
    assert_eq!(loaded.value(), json!({ "a": 1, "b": 2, "c": 3 }));
}

// ============================================================================
// Cache and registry
// ============================================================================

#[tokio::test]
async fn at_most_one_live_instance_per_id() {
    let (workspace, _store) = test_workspace();

    let first = workspace
        .create("Test", Some("obj-1".into()), json!({}))
        .await
        .unwrap();

    // A second construction under the same ID is refused registration but
    // still usable by its caller; the first instance stays cached.
    let second = workspace
        .create("Test", Some("obj-1".into()), json!({}))
        .await
        .unwrap();
    let cached = workspace.cache().lookup(&"obj-1".to_string()).unwrap();
    assert!(Arc::ptr_eq(&cached, &first));
    assert!(!Arc::ptr_eq(&cached, &second));

    // Direct registration reports the collision as a typed error.
    let err = workspace
        .cache()
        .register("obj-1", second.clone())
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateObject(id) if id == "obj-1"));
}

#[tokio::test]
async fn get_object_caches_loaded_instances() {
    let (workspace, store) = test_workspace();
    workspace
        .create("Test", Some("obj-1".into()), json!({ "n": 1 }))
        .await
        .unwrap();

    let other = attach_workspace(&store);
    let loaded = other.get_object(&"obj-1".to_string()).await.unwrap();
    let again = other.get_object(&"obj-1".to_string()).await.unwrap();
    assert!(Arc::ptr_eq(&loaded, &again));
    assert_eq!(other.cache().len(), 1);
}

#[tokio::test]
async fn unknown_types_are_surfaced() {
    let (workspace, store) = test_workspace();

    let err = workspace.create_object("Ghost", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::UnknownType(tag) if tag == "Ghost"));

    // A stored document with an unregistered tag fails at load.
    workspace
        .create("Ghost", Some("obj-g".into()), json!({}))
        .await
        .unwrap();
    let err = attach_workspace(&store)
        .load_object(&"obj-g".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownType(tag) if tag == "Ghost"));
}

// ============================================================================
// Round-trip persistence
// ============================================================================

#[tokio::test]
async fn round_trip_load_reconstructs_the_object() {
    let (workspace, store) = test_workspace();
    let obj = workspace
        .create("Test", Some("obj-1".into()), json!({ "title": "hello" }))
        .await
        .unwrap();
    obj.mutate(|value| value["count"] = json!(7)).await.unwrap();

    let loaded = attach_workspace(&store)
        .load_object(&"obj-1".to_string())
        .await
        .unwrap();
    assert_eq!(loaded.object_id(), "obj-1");
    assert_eq!(loaded.type_tag(), "Test");
    assert_eq!(loaded.value(), json!({ "title": "hello", "count": 7 }));
}

#[tokio::test]
async fn missing_documents_fail_with_not_found() {
    let (workspace, _store) = test_workspace();
    let err = workspace
        .load_object(&"no-such-object".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// ============================================================================
// Conflict reconciliation
// ============================================================================

#[tokio::test]
async fn two_replica_edits_merge_and_drain() {
    let (workspace, store) = test_workspace();
    let obj = workspace
        .create("Test", Some("obj-1".into()), json!({}))
        .await
        .unwrap();
    obj.mutate(|value| value["local"] = json!("here")).await.unwrap();

    inject_replica_edit(&store, &"obj-1".to_string(), "remote", |value| {
        value["remote"] = json!("there");
    })
    .await;
    assert_eq!(store.conflict_count(&"obj-1".to_string()), 1);

    obj.reconcile().await.unwrap();

    // Both fields survive, the sibling is gone, the canonical doc is clean.
    assert_eq!(obj.value(), json!({ "local": "here", "remote": "there" }));
    assert_eq!(store.conflict_count(&"obj-1".to_string()), 0);
    let doc = store
        .get(&"obj-1".to_string(), GetOptions::with_conflicts())
        .await
        .unwrap();
    assert!(doc.conflicts.is_empty());
    assert_eq!(obj.revision(), doc.rev);
}

#[tokio::test]
async fn every_conflicting_revision_is_drained() {
    let (workspace, store) = test_workspace();
    let obj = workspace
        .create("Test", Some("obj-1".into()), json!({}))
        .await
        .unwrap();

    inject_replica_edit(&store, &"obj-1".to_string(), "replica-a", |value| {
        value["a"] = json!(1);
    })
    .await;
    inject_replica_edit(&store, &"obj-1".to_string(), "replica-b", |value| {
        value["b"] = json!(2);
    })
    .await;
    inject_replica_edit(&store, &"obj-1".to_string(), "replica-c", |value| {
        value["c"] = json!(3);
    })
    .await;
    assert_eq!(store.conflict_count(&"obj-1".to_string()), 3);

    obj.reconcile().await.unwrap();

    assert_eq!(store.conflict_count(&"obj-1".to_string()), 0);
    assert_eq!(obj.value(), json!({ "a": 1, "b": 2, "c": 3 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_mutates_and_conflicts_lose_nothing() {
    let (workspace, store) = test_workspace();
    let obj = workspace
        .create("Test", Some("obj-1".into()), json!({}))
        .await
        .unwrap();

    // Race concurrent local mutations against replica writes landing
    // mid-stream; the per-object gate must keep every edit.
    let mut writers = Vec::new();
    for i in 0..8 {
        let obj = obj.clone();
        writers.push(tokio::spawn(async move {
            let field = format!("local{i}");
            obj.mutate(move |value| value[field.as_str()] = json!(i))
                .await
                .unwrap();
        }));
        if i % 2 == 0 {
            let field = format!("remote{i}");
            inject_replica_edit(&store, &"obj-1".to_string(), &format!("replica-{i}"), move |value| {
                value[field.as_str()] = json!(i);
            })
            .await;
        }
    }
    for writer in writers {
        writer.await.unwrap();
    }

    // Give the background listener a beat, then force a settling pass.
    tokio::time::sleep(Duration::from_millis(500)).await;
    obj.reconcile().await.unwrap();

    let value = obj.value();
    for i in 0..8 {
        assert_eq!(value[format!("local{i}").as_str()], json!(i));
    }
    for i in [0, 2, 4, 6] {
        assert_eq!(value[format!("remote{i}").as_str()], json!(i));
    }
    assert_eq!(store.conflict_count(&"obj-1".to_string()), 0);
}

#[tokio::test]
async fn settlement_is_idempotent() {
    let (workspace, store) = test_workspace();
    let obj = workspace
        .create("Test", Some("obj-1".into()), json!({ "n": 0 }))
        .await
        .unwrap();
    inject_replica_edit(&store, &"obj-1".to_string(), "remote", |value| {
        value["m"] = json!(1);
    })
    .await;

    obj.reconcile().await.unwrap();
    let settled = obj.state();
    let settled_rev = obj.revision();

    obj.reconcile().await.unwrap();
    assert_eq!(obj.state(), settled);
    assert_eq!(obj.revision(), settled_rev);
    assert_eq!(store.conflict_count(&"obj-1".to_string()), 0);
}

#[tokio::test]
async fn clean_passes_do_not_write_back() {
    let (workspace, store) = test_workspace();
    let obj = workspace
        .create("Test", Some("obj-1".into()), json!({ "n": 0 }))
        .await
        .unwrap();
    let rev_before = store
        .get(&"obj-1".to_string(), GetOptions::default())
        .await
        .unwrap()
        .rev;

    obj.reconcile().await.unwrap();

    let rev_after = store
        .get(&"obj-1".to_string(), GetOptions::default())
        .await
        .unwrap()
        .rev;
    assert_eq!(rev_before, rev_after);
}

#[tokio::test]
async fn failed_conflict_pass_is_all_or_nothing() {
    let mem = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(mem.clone()));
    let workspace = Workspace::new(flaky.clone(), Arc::new(DeltaEngine::new()));
    register_test_type(&workspace);

    let obj = workspace
        .create("Test", Some("obj-1".into()), json!({}))
        .await
        .unwrap();
    obj.mutate(|value| value["local"] = json!(true)).await.unwrap();
    inject_replica_edit(&mem, &"obj-1".to_string(), "remote", |value| {
        value["remote"] = json!(true);
    })
    .await;

    // The delete fails mid-pass: the pass reports the error, the sibling
    // stays in the store, but the merge already happened so no edit is lost.
    flaky.fail_removes(1);
    let err = obj.reconcile().await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(mem.conflict_count(&"obj-1".to_string()), 1);
    assert_eq!(obj.value(), json!({ "local": true, "remote": true }));

    // The repeated pass settles everything.
    obj.reconcile().await.unwrap();
    assert_eq!(mem.conflict_count(&"obj-1".to_string()), 0);
    let doc = mem
        .get(&"obj-1".to_string(), GetOptions::with_conflicts())
        .await
        .unwrap();
    assert!(doc.conflicts.is_empty());
}

// ============================================================================
// Observers
// ============================================================================

#[tokio::test]
async fn observers_fire_once_per_completed_pass() {
    let (workspace, _store) = test_workspace();
    let obj = workspace
        .create("Test", Some("obj-1".into()), json!({}))
        .await
        .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let id = obj.on_change(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    obj.reconcile().await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    obj.reconcile().await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);

    obj.off_change(id);
    obj.reconcile().await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert_eq!(obj.observer_count(), 0);
}

#[tokio::test]
async fn notification_iterates_over_a_snapshot() {
    let (workspace, _store) = test_workspace();
    let obj = workspace
        .create("Test", Some("obj-1".into()), json!({}))
        .await
        .unwrap();

    // An observer that registers another observer mid-pass: the newcomer
    // must not run during the pass that added it.
    let late_fires = Arc::new(AtomicUsize::new(0));
    let handle = obj.clone();
    let late = late_fires.clone();
    obj.on_change(move || {
        let late = late.clone();
        handle.on_change(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
    });

    obj.reconcile().await.unwrap();
    assert_eq!(late_fires.load(Ordering::SeqCst), 0);
    assert_eq!(obj.observer_count(), 2);

    // Next pass runs both the original and the previously added newcomer.
    obj.reconcile().await.unwrap();
    assert_eq!(late_fires.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn remote_writes_notify_through_the_change_feed() {
    let (workspace, store) = test_workspace();
    let obj = workspace
        .create("Test", Some("obj-1".into()), json!({}))
        .await
        .unwrap();

    let settled = Arc::new(Notify::new());
    let signal = settled.clone();
    obj.on_change(move || signal.notify_one());

    inject_replica_edit(&store, &"obj-1".to_string(), "remote", |value| {
        value["remote"] = json!(42);
    })
    .await;

    tokio::time::timeout(Duration::from_secs(2), settled.notified())
        .await
        .expect("background reconciliation should settle and notify");
    assert_eq!(obj.value()["remote"], json!(42));
    assert_eq!(store.conflict_count(&"obj-1".to_string()), 0);
}

// ============================================================================
// Removal
// ============================================================================

#[tokio::test]
async fn remove_deletes_document_and_cache_entry() {
    let (workspace, store) = test_workspace();
    let obj = workspace
        .create("Test", Some("obj-1".into()), json!({ "n": 1 }))
        .await
        .unwrap();

    obj.remove().await.unwrap();

    assert!(workspace.cache().lookup(&"obj-1".to_string()).is_none());
    assert!(!store.contains(&"obj-1".to_string()));
    let err = workspace
        .load_object(&"obj-1".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    // The instance is inert from here on.
    let err = obj.mutate(|value| value["n"] = json!(2)).await.unwrap_err();
    assert!(matches!(err, Error::ObjectRemoved(_)));
    let err = obj.reconcile().await.unwrap_err();
    assert!(matches!(err, Error::ObjectRemoved(_)));
    assert!(obj.is_removed());

    // Removing twice is fine.
    obj.remove().await.unwrap();
}

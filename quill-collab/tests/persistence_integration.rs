//! Persistence integration tests against RocksDB.
//!
//! Verifies:
//! - Checkpoint + log tail roundtrip through the store
//! - Crash recovery: documents survive a reopened database
//! - Replay of the durable tail written after the last checkpoint
//! - Multi-document isolation
//! - Checkpoint versions never regress

use std::sync::Arc;

use quill_collab::coordinator::CoordinatorConfig;
use quill_collab::event_log::EventLogEntry;
use quill_collab::hub::DocumentHub;
use quill_collab::operation::Operation;
use quill_collab::storage::{Checkpoint, CheckpointStore, RocksCheckpointStore, StoreConfig};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open(path: &std::path::Path) -> Arc<RocksCheckpointStore> {
    Arc::new(RocksCheckpointStore::open(StoreConfig::for_testing(path)).unwrap())
}

fn checkpoint(doc: &str, text: &str, version: u64) -> Checkpoint {
    Checkpoint {
        document_id: doc.to_string(),
        text: text.to_string(),
        version,
        saved_at: 1_700_000_000_000,
    }
}

fn insert_entry(version: u64, pos: usize, text: &str) -> EventLogEntry {
    EventLogEntry {
        version,
        op: Operation::insert(pos, text, "writer", version).with_origin(version - 1),
        timestamp: version,
        removed: None,
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

#[test]
fn test_checkpoint_and_tail_roundtrip() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    store.save_checkpoint(&checkpoint("doc", "hello", 3)).unwrap();
    store.append_log("doc", &insert_entry(4, 5, " world")).unwrap();
    store.append_log("doc", &insert_entry(5, 11, "!")).unwrap();

    let cp = store.load_checkpoint("doc").unwrap().unwrap();
    assert_eq!((cp.text.as_str(), cp.version), ("hello", 3));

    let tail = store.load_log_since("doc", 3).unwrap();
    assert_eq!(tail.iter().map(|e| e.version).collect::<Vec<_>>(), vec![4, 5]);
    assert_eq!(tail[0], insert_entry(4, 5, " world"));

    let meta = store.load_metadata("doc").unwrap().unwrap();
    assert_eq!(meta.checkpoint_version, 3);
    assert_eq!(meta.last_log_version, 5);
}

#[test]
fn test_data_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path());
        store.save_checkpoint(&checkpoint("doc", "durable text", 7)).unwrap();
        store.append_log("doc", &insert_entry(8, 0, ">")).unwrap();
        store.flush().unwrap();
    }

    let store = open(dir.path());
    assert_eq!(store.load_checkpoint("doc").unwrap().unwrap().text, "durable text");
    assert_eq!(store.load_log_since("doc", 7).unwrap().len(), 1);
    assert_eq!(store.list_documents().unwrap(), vec!["doc".to_string()]);
}

#[test]
fn test_checkpoint_never_regresses() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    assert!(store.save_checkpoint(&checkpoint("doc", "newer", 10)).unwrap());
    assert!(!store.save_checkpoint(&checkpoint("doc", "older", 4)).unwrap());
    assert!(!store.save_checkpoint(&checkpoint("doc", "same", 10)).unwrap());

    assert_eq!(store.load_checkpoint("doc").unwrap().unwrap().text, "newer");
}

#[test]
fn test_truncate_drops_only_covered_entries() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    for v in 1..=6 {
        store.append_log("doc", &insert_entry(v, 0, "x")).unwrap();
    }

    assert_eq!(store.truncate_log("doc", 4).unwrap(), 4);
    let rest = store.load_log_since("doc", 0).unwrap();
    assert_eq!(rest.iter().map(|e| e.version).collect::<Vec<_>>(), vec![5, 6]);
}

#[test]
fn test_multi_document_isolation() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    // "doc" is a prefix of "doc2"; length-prefixed keys keep them apart.
    store.save_checkpoint(&checkpoint("doc", "first", 1)).unwrap();
    store.save_checkpoint(&checkpoint("doc2", "second", 1)).unwrap();
    store.append_log("doc", &insert_entry(2, 0, "a")).unwrap();
    store.append_log("doc2", &insert_entry(2, 0, "b")).unwrap();
    store.append_log("doc2", &insert_entry(3, 0, "c")).unwrap();

    assert_eq!(store.load_log_since("doc", 0).unwrap().len(), 1);
    assert_eq!(store.load_log_since("doc2", 0).unwrap().len(), 2);
    assert_eq!(store.load_checkpoint("doc2").unwrap().unwrap().text, "second");

    let mut ids = store.list_documents().unwrap();
    ids.sort();
    assert_eq!(ids, vec!["doc".to_string(), "doc2".to_string()]);
}

#[test]
fn test_large_document_is_compressed() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let text = "the quick brown fox jumps over the lazy dog. ".repeat(5_000);

    store.save_checkpoint(&checkpoint("big", &text, 1)).unwrap();
    assert_eq!(store.load_checkpoint("big").unwrap().unwrap().text, text);

    let meta = store.load_metadata("big").unwrap().unwrap();
    assert!(meta.compressed_size * 5 < meta.checkpoint_size, "{meta:?}");
}

// ─── Through the hub ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_hub_reload_after_restart() {
    let dir = tempdir().unwrap();
    let (tx, _rx) = mpsc::channel(64);

    {
        let hub = DocumentHub::new(open(dir.path()), CoordinatorConfig::for_testing());
        let (doc, _) = hub.join("notes", "alice", "Alice", tx.clone(), Uuid::new_v4()).await.unwrap();
        doc.submit_operation("alice", Operation::insert(0, "persist me", "alice", 1), 0)
            .await
            .unwrap();
        doc.submit_operation("alice", Operation::delete(0, 8, "alice", 2), 1)
            .await
            .unwrap();
        hub.shutdown().await;
    }

    let hub = DocumentHub::new(open(dir.path()), CoordinatorConfig::for_testing());
    let (doc, snapshot) = hub.join("notes", "bob", "Bob", tx, Uuid::new_v4()).await.unwrap();
    assert_eq!((snapshot.text.as_str(), snapshot.version), ("me", 2));
    assert_eq!(doc.inspect().await.unwrap().durable_version, 2);
}

#[tokio::test]
async fn test_tail_replayed_when_checkpoint_is_behind() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    store.save_checkpoint(&checkpoint("doc", "abc", 1)).unwrap();
    store.append_log("doc", &insert_entry(2, 3, "d")).unwrap();
    store.append_log("doc", &insert_entry(3, 0, ">")).unwrap();
    // v5 without v4 is not contiguous and must be ignored.
    store.append_log("doc", &insert_entry(5, 0, "!")).unwrap();

    let hub = DocumentHub::new(store, CoordinatorConfig::for_testing());
    let info = timeout(Duration::from_secs(2), async {
        hub.handle("doc").await.inspect().await.unwrap()
    })
    .await
    .unwrap();

    assert_eq!((info.text.as_str(), info.version), (">abcd", 3));
    assert_eq!((info.log_base, info.log_len), (1, 2));
}

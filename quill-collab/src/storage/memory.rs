//! In-process checkpoint store for tests and ephemeral deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{Checkpoint, CheckpointStore, StoreError};
use crate::event_log::EventLogEntry;
use crate::operation::{DocumentId, Version};

#[derive(Default)]
struct Inner {
    checkpoints: HashMap<DocumentId, Checkpoint>,
    tails: HashMap<DocumentId, BTreeMap<Version, EventLogEntry>>,
}

/// `CheckpointStore` backed by hash maps.
///
/// Can be told to fail the next N checkpoint writes or log appends, which is
/// how retry and alerting paths are exercised.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<Inner>,
    failures_pending: AtomicU32,
    append_failures_pending: AtomicU32,
    checkpoint_writes: AtomicU64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `save_checkpoint` fail.
    pub fn fail_next_checkpoints(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `append_log` fail.
    pub fn fail_next_appends(&self, count: u32) {
        self.append_failures_pending.store(count, Ordering::SeqCst);
    }

    /// Number of checkpoints actually written.
    pub fn checkpoint_writes(&self) -> u64 {
        self.checkpoint_writes.load(Ordering::Relaxed)
    }

    /// Number of durable tail entries held for `document_id`.
    pub fn tail_len(&self, document_id: &str) -> usize {
        self.lock()
            .map(|inner| inner.tails.get(document_id).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

fn take_failure(pending: &AtomicU32) -> bool {
    pending
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load_checkpoint(&self, document_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.lock()?.checkpoints.get(document_id).cloned())
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<bool, StoreError> {
        if take_failure(&self.failures_pending) {
            return Err(StoreError::Database("injected checkpoint failure".into()));
        }

        let mut inner = self.lock()?;
        if let Some(existing) = inner.checkpoints.get(&checkpoint.document_id) {
            if existing.version >= checkpoint.version {
                return Ok(false);
            }
        }
        inner
            .checkpoints
            .insert(checkpoint.document_id.clone(), checkpoint.clone());
        self.checkpoint_writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn append_log(&self, document_id: &str, entry: &EventLogEntry) -> Result<(), StoreError> {
        if take_failure(&self.append_failures_pending) {
            return Err(StoreError::Database("injected append failure".into()));
        }
        self.lock()?
            .tails
            .entry(document_id.to_string())
            .or_default()
            .insert(entry.version, entry.clone());
        Ok(())
    }

    fn load_log_since(
        &self,
        document_id: &str,
        after: Version,
    ) -> Result<Vec<EventLogEntry>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .tails
            .get(document_id)
            .map(|tail| {
                tail.range(after.saturating_add(1)..)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn truncate_log(&self, document_id: &str, up_to: Version) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        let Some(tail) = inner.tails.get_mut(document_id) else {
            return Ok(0);
        };
        let keep = tail.split_off(&up_to.saturating_add(1));
        let removed = tail.len() as u64;
        *tail = keep;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;

    fn checkpoint(version: Version, text: &str) -> Checkpoint {
        Checkpoint {
            document_id: "doc".into(),
            text: text.into(),
            version,
            saved_at: 1,
        }
    }

    fn entry(version: Version) -> EventLogEntry {
        EventLogEntry {
            version,
            op: Operation::insert(0, "a", "u", version),
            timestamp: version,
            removed: None,
        }
    }

    #[test]
    fn test_checkpoint_never_regresses() {
        let store = MemoryCheckpointStore::new();
        assert!(store.save_checkpoint(&checkpoint(5, "five")).unwrap());
        assert!(!store.save_checkpoint(&checkpoint(3, "three")).unwrap());
        assert!(!store.save_checkpoint(&checkpoint(5, "five again")).unwrap());
        assert_eq!(store.load_checkpoint("doc").unwrap().unwrap().text, "five");
        assert_eq!(store.checkpoint_writes(), 1);
    }

    #[test]
    fn test_injected_failures() {
        let store = MemoryCheckpointStore::new();
        store.fail_next_checkpoints(2);
        assert!(store.save_checkpoint(&checkpoint(1, "a")).is_err());
        assert!(store.save_checkpoint(&checkpoint(1, "a")).is_err());
        assert!(store.save_checkpoint(&checkpoint(1, "a")).unwrap());

        store.fail_next_appends(1);
        assert!(store.append_log("doc", &entry(1)).is_err());
        assert_eq!(store.tail_len("doc"), 0);
        store.append_log("doc", &entry(1)).unwrap();
        assert_eq!(store.tail_len("doc"), 1);
    }

    #[test]
    fn test_log_tail_since_and_truncate() {
        let store = MemoryCheckpointStore::new();
        for v in 1..=6 {
            store.append_log("doc", &entry(v)).unwrap();
        }
        let since = store.load_log_since("doc", 4).unwrap();
        assert_eq!(since.iter().map(|e| e.version).collect::<Vec<_>>(), vec![5, 6]);

        assert_eq!(store.truncate_log("doc", 3).unwrap(), 3);
        assert_eq!(store.tail_len("doc"), 3);
        assert_eq!(store.truncate_log("missing", 3).unwrap(), 0);
        assert!(store.load_log_since("missing", 0).unwrap().is_empty());
    }
}

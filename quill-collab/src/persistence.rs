//! Per-document persistence task.
//!
//! ```text
//! Coordinator ──PersistJob──► persistence task ──spawn_blocking──► CheckpointStore
//!      ▲                             │
//!      └──────PersistEvent───────────┘  (checkpoint durable / failed)
//! ```
//!
//! Jobs are processed strictly in submission order, so a checkpoint is only
//! written after every log entry queued before it. Consecutive log appends
//! are written in one blocking call. Appends and checkpoints are retried
//! with exponential backoff; when retries run out an operator alert is
//! logged and the failure counted, but the session keeps running. A failed
//! append is reported back so the coordinator can cover the hole in the
//! durable tail with a checkpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event_log::EventLogEntry;
use crate::operation::{DocumentId, UserId, Version};
use crate::storage::{Checkpoint, CheckpointStore, StoreError};

#[derive(Debug, Clone)]
pub enum PersistJob {
    Append(EventLogEntry),
    Checkpoint {
        checkpoint: Checkpoint,
        requested_by: Option<UserId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistEvent {
    CheckpointDurable {
        version: Version,
        requested_by: Option<UserId>,
    },
    CheckpointFailed {
        version: Version,
        requested_by: Option<UserId>,
    },
    /// Entries from `from_version` on never reached the durable tail.
    AppendFailed { from_version: Version },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry; doubles each time
    pub backoff: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Persistence counters shared by every document.
#[derive(Debug, Default)]
pub struct PersistenceStats {
    log_appends: AtomicU64,
    append_retries: AtomicU64,
    append_failures: AtomicU64,
    checkpoints_written: AtomicU64,
    checkpoint_retries: AtomicU64,
    checkpoint_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceSnapshot {
    pub log_appends: u64,
    pub append_retries: u64,
    /// Entries abandoned after exhausting retries
    pub append_failures: u64,
    pub checkpoints_written: u64,
    pub checkpoint_retries: u64,
    /// Checkpoints abandoned after exhausting retries
    pub checkpoint_failures: u64,
}

impl PersistenceStats {
    pub fn snapshot(&self) -> PersistenceSnapshot {
        PersistenceSnapshot {
            log_appends: self.log_appends.load(Ordering::Relaxed),
            append_retries: self.append_retries.load(Ordering::Relaxed),
            append_failures: self.append_failures.load(Ordering::Relaxed),
            checkpoints_written: self.checkpoints_written.load(Ordering::Relaxed),
            checkpoint_retries: self.checkpoint_retries.load(Ordering::Relaxed),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
        }
    }
}

/// Start the persistence task for one document.
///
/// The task exits once every job sender is dropped and the queue is drained.
pub fn spawn_persistence(
    document_id: DocumentId,
    store: Arc<dyn CheckpointStore>,
    policy: RetryPolicy,
    stats: Arc<PersistenceStats>,
    events: mpsc::UnboundedSender<PersistEvent>,
) -> (mpsc::UnboundedSender<PersistJob>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let persister = Persister {
        document_id,
        store,
        policy,
        stats,
        events,
    };
    let handle = tokio::spawn(persister.run(rx));
    (tx, handle)
}

struct Persister {
    document_id: DocumentId,
    store: Arc<dyn CheckpointStore>,
    policy: RetryPolicy,
    stats: Arc<PersistenceStats>,
    events: mpsc::UnboundedSender<PersistEvent>,
}

impl Persister {
    async fn run(self, mut jobs: mpsc::UnboundedReceiver<PersistJob>) {
        while let Some(first) = jobs.recv().await {
            let mut appends = Vec::new();
            let mut next = Some(first);

            while let Some(job) = next.take().or_else(|| jobs.try_recv().ok()) {
                match job {
                    PersistJob::Append(entry) => appends.push(entry),
                    PersistJob::Checkpoint {
                        checkpoint,
                        requested_by,
                    } => {
                        self.flush_appends(std::mem::take(&mut appends)).await;
                        self.checkpoint(checkpoint, requested_by).await;
                    }
                }
            }
            self.flush_appends(appends).await;
        }
        log::debug!("Persistence task for {} finished", self.document_id);
    }

    async fn flush_appends(&self, mut entries: Vec<EventLogEntry>) {
        if entries.is_empty() {
            return;
        }

        for attempt in 0..=self.policy.max_retries {
            let store = Arc::clone(&self.store);
            let id = self.document_id.clone();
            let batch = entries.clone();
            let (written, result) = tokio::task::spawn_blocking(move || {
                let mut written = 0;
                for entry in &batch {
                    if let Err(e) = store.append_log(&id, entry) {
                        return (written, Err(e));
                    }
                    written += 1;
                }
                (written, Ok(()))
            })
            .await
            .unwrap_or_else(|e| (0, Err(StoreError::Database(e.to_string()))));

            self.stats.log_appends.fetch_add(written as u64, Ordering::Relaxed);
            entries.drain(..written);

            match result {
                Ok(()) => return,
                Err(e) if attempt < self.policy.max_retries => {
                    let delay = self.policy.delay(attempt);
                    log::warn!(
                        "Log tail append for {} failed at v{} (attempt {}): {e}; retrying in {delay:?}",
                        self.document_id,
                        entries.first().map_or(0, |e| e.version),
                        attempt + 1
                    );
                    self.stats.append_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    log::error!(
                        "ALERT: log tail append for {} abandoned after {} attempts: {e}",
                        self.document_id,
                        attempt + 1
                    );
                }
            }
        }

        self.stats
            .append_failures
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        if let Some(first) = entries.first() {
            let _ = self.events.send(PersistEvent::AppendFailed {
                from_version: first.version,
            });
        }
    }

    async fn checkpoint(&self, checkpoint: Checkpoint, requested_by: Option<UserId>) {
        let version = checkpoint.version;

        for attempt in 0..=self.policy.max_retries {
            let store = Arc::clone(&self.store);
            let cp = checkpoint.clone();
            let result = tokio::task::spawn_blocking(move || store.save_checkpoint(&cp))
                .await
                .unwrap_or_else(|e| Err(StoreError::Database(e.to_string())));

            match result {
                Ok(written) => {
                    if written {
                        self.stats.checkpoints_written.fetch_add(1, Ordering::Relaxed);
                        log::info!("Checkpoint v{version} of {} is durable", self.document_id);
                    }
                    self.trim_tail(version).await;
                    let _ = self.events.send(PersistEvent::CheckpointDurable {
                        version,
                        requested_by,
                    });
                    return;
                }
                Err(e) if attempt < self.policy.max_retries => {
                    let delay = self.policy.delay(attempt);
                    log::warn!(
                        "Checkpoint v{version} of {} failed (attempt {}): {e}; retrying in {delay:?}",
                        self.document_id,
                        attempt + 1
                    );
                    self.stats.checkpoint_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    log::error!(
                        "ALERT: checkpoint v{version} of {} abandoned after {} attempts: {e}",
                        self.document_id,
                        attempt + 1
                    );
                }
            }
        }

        self.stats.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(PersistEvent::CheckpointFailed {
            version,
            requested_by,
        });
    }

    /// Durable tail entries covered by a checkpoint are no longer needed.
    async fn trim_tail(&self, version: Version) {
        let store = Arc::clone(&self.store);
        let id = self.document_id.clone();
        let result = tokio::task::spawn_blocking(move || store.truncate_log(&id, version))
            .await
            .unwrap_or_else(|e| Err(StoreError::Database(e.to_string())));
        match result {
            Ok(removed) => log::trace!("Trimmed {removed} tail entries of {}", self.document_id),
            Err(e) => log::warn!("Could not trim log tail of {}: {e}", self.document_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::storage::MemoryCheckpointStore;

    fn entry(version: Version) -> EventLogEntry {
        EventLogEntry {
            version,
            op: Operation::insert(0, "a", "u", version),
            timestamp: version,
            removed: None,
        }
    }

    fn checkpoint(version: Version) -> Checkpoint {
        Checkpoint {
            document_id: "doc".into(),
            text: "a".repeat(version as usize),
            version,
            saved_at: 0,
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let p = RetryPolicy { max_retries: 3, backoff: Duration::from_millis(10) };
        assert_eq!(p.delay(0), Duration::from_millis(10));
        assert_eq!(p.delay(1), Duration::from_millis(20));
        assert_eq!(p.delay(3), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_appends_then_checkpoint_in_order() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let stats = Arc::new(PersistenceStats::default());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (jobs, handle) =
            spawn_persistence("doc".into(), store.clone(), policy(0), stats.clone(), events_tx);

        for v in 1..=5 {
            jobs.send(PersistJob::Append(entry(v))).unwrap();
        }
        jobs.send(PersistJob::Checkpoint {
            checkpoint: checkpoint(3),
            requested_by: Some("alice".into()),
        })
        .unwrap();
        drop(jobs);
        handle.await.unwrap();

        assert_eq!(
            events_rx.recv().await,
            Some(PersistEvent::CheckpointDurable { version: 3, requested_by: Some("alice".into()) })
        );
        // Entries 1..=3 are covered by the checkpoint and trimmed.
        assert_eq!(store.tail_len("doc"), 2);
        assert_eq!(store.load_checkpoint("doc").unwrap().unwrap().version, 3);

        let snap = stats.snapshot();
        assert_eq!(snap.log_appends, 5);
        assert_eq!(snap.checkpoints_written, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_retries_then_succeeds() {
        let store = Arc::new(MemoryCheckpointStore::new());
        store.fail_next_checkpoints(2);
        let stats = Arc::new(PersistenceStats::default());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (jobs, handle) =
            spawn_persistence("doc".into(), store.clone(), policy(3), stats.clone(), events_tx);

        jobs.send(PersistJob::Checkpoint { checkpoint: checkpoint(1), requested_by: None })
            .unwrap();
        drop(jobs);
        handle.await.unwrap();

        assert!(matches!(
            events_rx.recv().await,
            Some(PersistEvent::CheckpointDurable { version: 1, .. })
        ));
        assert_eq!(stats.snapshot().checkpoint_retries, 2);
        assert_eq!(stats.snapshot().checkpoint_failures, 0);
    }

    #[tokio::test]
    async fn test_append_retries_resume_after_last_written_entry() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let stats = Arc::new(PersistenceStats::default());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (jobs, handle) =
            spawn_persistence("doc".into(), store.clone(), policy(3), stats.clone(), events_tx);

        store.fail_next_appends(2);
        for v in 1..=3 {
            jobs.send(PersistJob::Append(entry(v))).unwrap();
        }
        drop(jobs);
        handle.await.unwrap();

        assert_eq!(store.tail_len("doc"), 3);
        let snap = stats.snapshot();
        assert_eq!(snap.log_appends, 3);
        assert_eq!(snap.append_retries, 2);
        assert_eq!(snap.append_failures, 0);
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_abandoned_append_is_reported() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let stats = Arc::new(PersistenceStats::default());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (jobs, handle) =
            spawn_persistence("doc".into(), store.clone(), policy(1), stats.clone(), events_tx);

        jobs.send(PersistJob::Append(entry(1))).unwrap();
        // Let v1 land before the store starts failing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.fail_next_appends(10);
        jobs.send(PersistJob::Append(entry(2))).unwrap();
        jobs.send(PersistJob::Append(entry(3))).unwrap();
        drop(jobs);
        handle.await.unwrap();

        assert_eq!(events_rx.recv().await, Some(PersistEvent::AppendFailed { from_version: 2 }));
        assert_eq!(store.tail_len("doc"), 1);
        assert_eq!(stats.snapshot().append_failures, 2);
    }

    #[tokio::test]
    async fn test_checkpoint_gives_up_after_retries() {
        let store = Arc::new(MemoryCheckpointStore::new());
        store.fail_next_checkpoints(10);
        let stats = Arc::new(PersistenceStats::default());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (jobs, handle) =
            spawn_persistence("doc".into(), store.clone(), policy(2), stats.clone(), events_tx);

        jobs.send(PersistJob::Append(entry(1))).unwrap();
        jobs.send(PersistJob::Checkpoint { checkpoint: checkpoint(1), requested_by: None })
            .unwrap();
        drop(jobs);
        handle.await.unwrap();

        assert!(matches!(
            events_rx.recv().await,
            Some(PersistEvent::CheckpointFailed { version: 1, .. })
        ));
        let snap = stats.snapshot();
        assert_eq!(snap.checkpoint_failures, 1);
        assert_eq!(snap.checkpoint_retries, 2);
        // The tail still carries the entry.
        assert_eq!(store.tail_len("doc"), 1);
        assert!(store.load_checkpoint("doc").unwrap().is_none());
    }
}

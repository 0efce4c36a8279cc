//! Document hub: routes document ids to running coordinators.
//!
//! Coordinators are spawned on first use and remove themselves after idle
//! eviction. Each spawn gets a fresh generation number; the reaper only
//! removes a map entry whose generation matches the coordinator that
//! stopped, so an eviction can never remove its own replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::broadcast::{BroadcastStats, Broadcaster};
use crate::coordinator::{
    self, CoordinatorConfig, CoordinatorContext, CoordinatorHandle, JoinSnapshot,
};
use crate::error::{CollabError, CollabResult};
use crate::operation::DocumentId;
use crate::persistence::{PersistenceSnapshot, PersistenceStats};
use crate::presence::Outbound;
use crate::storage::CheckpointStore;

/// Joins retried against a fresh coordinator when the current one is
/// shutting down.
const JOIN_ATTEMPTS: usize = 3;

type DocumentMap = Arc<RwLock<HashMap<DocumentId, CoordinatorHandle>>>;

pub struct DocumentHub {
    documents: DocumentMap,
    config: CoordinatorConfig,
    context: CoordinatorContext,
    next_generation: AtomicU64,
    broadcaster: Arc<Broadcaster>,
    persistence_stats: Arc<PersistenceStats>,
}

impl DocumentHub {
    /// Create a hub. Must be called inside a tokio runtime (spawns the
    /// reaper task).
    pub fn new(store: Arc<dyn CheckpointStore>, config: CoordinatorConfig) -> Self {
        let documents: DocumentMap = Arc::new(RwLock::new(HashMap::new()));
        let (evicted_tx, evicted_rx) = mpsc::unbounded_channel();
        tokio::spawn(reap(Arc::clone(&documents), evicted_rx));

        let broadcaster = Arc::new(Broadcaster::new());
        let persistence_stats = Arc::new(PersistenceStats::default());
        let context = CoordinatorContext {
            store,
            broadcaster: Arc::clone(&broadcaster),
            persistence_stats: Arc::clone(&persistence_stats),
            evicted: Some(evicted_tx),
        };

        Self {
            documents,
            config,
            context,
            next_generation: AtomicU64::new(1),
            broadcaster,
            persistence_stats,
        }
    }

    /// Handle for `document_id`, spawning (and loading) a coordinator if
    /// none is running. A coordinator that is still flushing is waited for
    /// first, so the replacement loads its final checkpoint.
    pub async fn handle(&self, document_id: &str) -> CoordinatorHandle {
        loop {
            {
                let docs = self.documents.read().await;
                if let Some(h) = docs.get(document_id) {
                    if !h.is_closed() {
                        return h.clone();
                    }
                }
            }

            let mut docs = self.documents.write().await;
            // Another task may have spawned it while we waited for the lock.
            let closing = match docs.get(document_id) {
                Some(h) if !h.is_closed() => return h.clone(),
                Some(h) => Some(h.clone()),
                None => None,
            };
            if let Some(closing) = closing {
                drop(docs);
                closing.closed().await;
                self.forget(&closing).await;
                continue;
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            log::debug!("Spawning coordinator for {document_id} (generation {generation})");
            let handle = coordinator::spawn(
                document_id,
                generation,
                self.config.clone(),
                self.context.clone(),
            );
            docs.insert(document_id.to_string(), handle.clone());
            return handle;
        }
    }

    /// Join `document_id`, retrying against a fresh coordinator if the
    /// current one closes underneath us.
    pub async fn join(
        &self,
        document_id: &str,
        user_id: &str,
        display_name: &str,
        channel: Outbound,
        connection_id: Uuid,
    ) -> CollabResult<(CoordinatorHandle, JoinSnapshot)> {
        let mut last_err = CollabError::DocumentClosed(document_id.to_string());

        for attempt in 1..=JOIN_ATTEMPTS {
            let handle = self.handle(document_id).await;
            match handle
                .join(user_id, display_name, channel.clone(), connection_id)
                .await
            {
                Ok(snapshot) => return Ok((handle, snapshot)),
                Err(CollabError::DocumentClosed(id)) => {
                    log::debug!("{id} closed during join by {user_id} (attempt {attempt}), retrying");
                    handle.closed().await;
                    self.forget(&handle).await;
                    last_err = CollabError::DocumentClosed(id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn forget(&self, handle: &CoordinatorHandle) {
        let mut docs = self.documents.write().await;
        if docs
            .get(handle.document_id())
            .is_some_and(|h| h.generation() == handle.generation())
        {
            docs.remove(handle.document_id());
        }
    }

    /// Handle for a document only if a coordinator is loaded. A coordinator
    /// that is still flushing after eviction counts as loaded.
    pub async fn get(&self, document_id: &str) -> Option<CoordinatorHandle> {
        self.documents.read().await.get(document_id).cloned()
    }

    pub async fn contains(&self, document_id: &str) -> bool {
        self.get(document_id).await.is_some()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self
            .documents
            .read()
            .await
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Flush and stop every coordinator.
    pub async fn shutdown(&self) {
        let handles: Vec<CoordinatorHandle> = self.documents.read().await.values().cloned().collect();
        log::info!("Shutting down {} documents", handles.len());
        for h in &handles {
            h.shutdown().await;
        }
        self.documents.write().await.clear();
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcaster.stats()
    }

    pub fn persistence_stats(&self) -> PersistenceSnapshot {
        self.persistence_stats.snapshot()
    }
}

async fn reap(
    documents: DocumentMap,
    mut evicted: mpsc::UnboundedReceiver<(DocumentId, u64)>,
) {
    while let Some((document_id, generation)) = evicted.recv().await {
        let mut docs = documents.write().await;
        if docs
            .get(&document_id)
            .is_some_and(|h| h.generation() == generation)
        {
            docs.remove(&document_id);
            log::info!("Document {document_id} evicted ({} active)", docs.len());
        }
    }
}

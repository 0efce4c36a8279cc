//! Checkpoint persistence for collaborative documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   jobs    ┌──────────────────┐  spawn_blocking  ┌─────────────────┐
//! │ Coordinator  │ ────────► │ persistence task │ ───────────────► │ CheckpointStore │
//! │ (per doc)    │ ◄──────── │ (per doc)        │                  │ (Rocks / memory)│
//! └──────────────┘  durable  └──────────────────┘                  └─────────────────┘
//! ```
//!
//! A store holds, per document, the latest checkpoint (text + version) and
//! the durable log tail written since. Reloading a document replays the
//! tail on top of the checkpoint. Checkpoints are version-tagged: a store
//! never replaces a checkpoint with an older one.
//!
//! Stores are synchronous; callers on the async runtime go through
//! `tokio::task::spawn_blocking`.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event_log::EventLogEntry;
use crate::operation::{DocumentId, Version};

pub use memory::MemoryCheckpointStore;
pub use rocks::{DocumentMetadata, RocksCheckpointStore, StoreConfig};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),
}

/// Durable copy of a document's text at a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub document_id: DocumentId,
    pub text: String,
    pub version: Version,
    /// Milliseconds since the Unix epoch
    pub saved_at: u64,
}

pub trait CheckpointStore: Send + Sync + 'static {
    /// Latest checkpoint for `document_id`, if any.
    fn load_checkpoint(&self, document_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Store `checkpoint` unless an equal or newer version is already held.
    ///
    /// Returns whether the checkpoint was written.
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<bool, StoreError>;

    /// Append one applied log entry to the durable tail.
    fn append_log(&self, document_id: &str, entry: &EventLogEntry) -> Result<(), StoreError>;

    /// Durable tail entries with version strictly greater than `after`, in order.
    fn load_log_since(
        &self,
        document_id: &str,
        after: Version,
    ) -> Result<Vec<EventLogEntry>, StoreError>;

    /// Remove tail entries with version `<= up_to`. Returns how many were removed.
    fn truncate_log(&self, document_id: &str, up_to: Version) -> Result<u64, StoreError>;
}

//! # quill-collab: real-time collaborative text editing
//!
//! Many participants edit one shared plain-text document over WebSockets.
//! Concurrent edits are reconciled with operational transformation against
//! a single authoritative coordinator per document.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  JSON over WS   ┌──────────────┐         ┌──────────────────┐
//! │ participant │ ◄─────────────► │ CollabServer │ ──────► │ DocumentHub      │
//! │ (browser)   │                 │ (gateway)    │         │ doc id → handle  │
//! └─────────────┘                 └──────────────┘         └────────┬─────────┘
//!                                                                   │
//!                                                   ┌───────────────▼───────────────┐
//!                                                   │ Coordinator (one per document)│
//!                                                   │ DocumentState · EventLog      │
//!                                                   │ SessionRegistry · Broadcaster │
//!                                                   └───────────────┬───────────────┘
//!                                                                   │ PersistJob
//!                                                          ┌────────▼────────┐
//!                                                          │ CheckpointStore │
//!                                                          │ (RocksDB, LZ4)  │
//!                                                          └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: `Operation` / `OpKind` and validation
//! - [`transform`]: transform, apply, compose and invert
//! - [`document`]: authoritative text plus version
//! - [`event_log`]: applied-operation log for catch-up and recovery
//! - [`presence`]: session registry and cursors
//! - [`broadcast`]: fan-out to participant queues
//! - [`persistence`]: background checkpoint and log-tail writer
//! - [`coordinator`]: per-document actor
//! - [`hub`]: document routing and eviction
//! - [`protocol`]: JSON wire messages
//! - [`server`]: WebSocket gateway
//! - [`storage`]: checkpoint stores (in-memory, RocksDB)

pub mod operation;
pub mod transform;
pub mod document;
pub mod event_log;
pub mod presence;
pub mod broadcast;
pub mod persistence;
pub mod coordinator;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod error;

// Re-exports for convenience
pub use operation::{DocumentId, OpKind, Operation, UserId, Version};
pub use transform::{apply, compact, compose, invert, transform};
pub use document::{Applied, DocumentState};
pub use event_log::{Attribution, EventLog, EventLogEntry, RecoverySnapshot};
pub use presence::{Participant, Selection, SessionRegistry};
pub use broadcast::{BroadcastStats, Broadcaster};
pub use persistence::{PersistenceSnapshot, RetryPolicy};
pub use coordinator::{
    CoordinatorConfig, CoordinatorHandle, DocumentInfo, JoinSnapshot, Recovery, Submitted,
};
pub use hub::DocumentHub;
pub use protocol::{ClientMessage, ProtocolError, RecoveryMode, ServerEvent, WireOp};
pub use server::{CollabServer, ConfigError, ServerConfig, ServerStats};
pub use storage::{
    Checkpoint, CheckpointStore, DocumentMetadata, MemoryCheckpointStore, RocksCheckpointStore,
    StoreConfig, StoreError,
};
pub use error::{CollabError, CollabResult};

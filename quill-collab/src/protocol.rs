//! JSON wire protocol between participants and the gateway.
//!
//! Every frame is a UTF-8 text message holding one JSON object tagged by
//! `type`:
//! ```text
//! client → server   join · edit_operation · cursor_position · leave
//!                   recover · undo · redo · save · ping
//! server → client   user_joined · user_left · document_change · ack
//!                   cursor_position · document_saved · presence
//!                   attribution · recovery · session_expired · error · pong
//! ```
//!
//! Operations travel as `{"op_type": "insert", "pos": 3, "text": "abc"}` or
//! `{"op_type": "delete", "pos": 3, "length": 2}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CollabError, CollabResult};
use crate::event_log::{Attribution, EventLogEntry};
use crate::operation::{OpKind, Operation, UserId, Version};
use crate::presence::Selection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Insert,
    Delete,
}

/// Operation as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireOp {
    pub op_type: OpType,
    /// Signed so that a negative position is reported as a validation error
    pub pos: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
}

impl WireOp {
    /// Convert to an `Operation` authored by `user_id`, validating its shape.
    pub fn into_operation(self, user_id: &str, timestamp: u64) -> CollabResult<Operation> {
        let position = usize::try_from(self.pos)
            .map_err(|_| CollabError::Validation(format!("negative position {}", self.pos)))?;

        let op = match self.op_type {
            OpType::Insert => {
                let text = self
                    .text
                    .ok_or_else(|| CollabError::Validation("insert requires text".into()))?;
                Operation::insert(position, text, user_id, timestamp)
            }
            OpType::Delete => {
                let length = self
                    .length
                    .ok_or_else(|| CollabError::Validation("delete requires length".into()))?;
                let length = usize::try_from(length)
                    .map_err(|_| CollabError::Validation(format!("negative length {length}")))?;
                Operation::delete(position, length, user_id, timestamp)
            }
        };
        op.validate()?;
        Ok(op)
    }
}

impl From<&Operation> for WireOp {
    fn from(op: &Operation) -> Self {
        match &op.kind {
            OpKind::Insert { text } => Self {
                op_type: OpType::Insert,
                pos: op.position as i64,
                text: Some(text.clone()),
                length: None,
            },
            OpKind::Delete { length } => Self {
                op_type: OpType::Delete,
                pos: op.position as i64,
                text: None,
                length: Some(*length as i64),
            },
        }
    }
}

/// Messages a participant sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        user_id: UserId,
        #[serde(default)]
        username: Option<String>,
    },
    EditOperation {
        #[serde(flatten)]
        op: WireOp,
        client_version: i64,
    },
    CursorPosition {
        position: usize,
        #[serde(default)]
        selection: Option<Selection>,
    },
    Leave,
    Recover {
        last_known_version: i64,
    },
    Undo,
    Redo,
    Save,
    Ping,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// One participant in a `presence` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub username: String,
    pub cursor: usize,
    #[serde(default)]
    pub selection: Option<Selection>,
    /// Milliseconds since the Unix epoch
    pub last_seen: u64,
}

/// One attributed change, used by `attribution` and recovery history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub user_id: UserId,
    pub op: WireOp,
    pub timestamp: u64,
}

impl From<&Attribution> for ChangeRecord {
    fn from(a: &Attribution) -> Self {
        Self {
            user_id: a.user_id.clone(),
            op: WireOp::from(&a.op),
            timestamp: a.timestamp,
        }
    }
}

impl From<&Operation> for ChangeRecord {
    fn from(op: &Operation) -> Self {
        Self {
            user_id: op.user_id.clone(),
            op: WireOp::from(op),
            timestamp: op.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// `history` holds every operation after the client's version
    Replay,
    /// `text` is the full document; `history` is the compacted retained log
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub mode: RecoveryMode,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub history: Vec<ChangeRecord>,
}

/// Events the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    UserJoined {
        user_id: UserId,
        username: String,
    },
    UserLeft {
        user_id: UserId,
    },
    DocumentChange {
        user_id: UserId,
        op: WireOp,
        version: Version,
        timestamp: u64,
    },
    /// Sent to the author instead of `document_change`.
    Ack {
        op: WireOp,
        version: Version,
    },
    CursorPosition {
        user_id: UserId,
        position: usize,
        #[serde(default)]
        selection: Option<Selection>,
    },
    DocumentSaved {
        user_id: UserId,
        version: Version,
        timestamp: u64,
    },
    Presence {
        users: Vec<PresenceEntry>,
    },
    Attribution {
        changes: Vec<ChangeRecord>,
    },
    Recovery {
        state: RecoveryState,
    },
    /// The participant was dropped for inactivity and must `join` again.
    SessionExpired {
        user_id: UserId,
    },
    Error {
        message: String,
        /// Set when the client should follow up with `recover`
        #[serde(default)]
        recover: bool,
    },
    Pong,
}

impl ServerEvent {
    pub fn document_change(entry: &EventLogEntry) -> Self {
        ServerEvent::DocumentChange {
            user_id: entry.op.user_id.clone(),
            op: WireOp::from(&entry.op),
            version: entry.version,
            timestamp: entry.timestamp,
        }
    }

    pub fn error(err: &CollabError) -> Self {
        ServerEvent::Error {
            message: err.to_string(),
            recover: err.requires_recovery(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("malformed message: {0}")]
    Deserialization(String),

    #[error("binary frames are not supported")]
    BinaryFrame,

    #[error("first message must be join")]
    NotJoined,

    #[error("already joined as {0}")]
    AlreadyJoined(UserId),
}

//! Atomic edit primitive.
//!
//! Positions and lengths count Unicode scalar values (`char`s), not bytes,
//! so that clients in any language agree on offsets.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::SystemTime;

use crate::error::{CollabError, CollabResult};

/// Participant identity as supplied by the identity resolver.
pub type UserId = String;

/// Document identity as routed by the gateway.
pub type DocumentId = String;

/// Monotonic document version.
pub type Version = u64;

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert { text: String },
    Delete { length: usize },
}

/// A single insert or delete against a specific document version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    /// Character offset the operation starts at
    pub position: usize,
    /// Version the operation was generated against
    pub origin_version: Version,
    pub user_id: UserId,
    /// Milliseconds since the Unix epoch, stamped at admission
    pub timestamp: u64,
}

impl Operation {
    pub fn insert(
        position: usize,
        text: impl Into<String>,
        user_id: impl Into<UserId>,
        timestamp: u64,
    ) -> Self {
        Self {
            kind: OpKind::Insert { text: text.into() },
            position,
            origin_version: 0,
            user_id: user_id.into(),
            timestamp,
        }
    }

    pub fn delete(position: usize, length: usize, user_id: impl Into<UserId>, timestamp: u64) -> Self {
        Self {
            kind: OpKind::Delete { length },
            position,
            origin_version: 0,
            user_id: user_id.into(),
            timestamp,
        }
    }

    /// Set the base version this operation was generated against.
    pub fn with_origin(mut self, origin_version: Version) -> Self {
        self.origin_version = origin_version;
        self
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert { .. })
    }

    /// Number of characters inserted or deleted.
    pub fn span(&self) -> usize {
        match &self.kind {
            OpKind::Insert { text } => text.chars().count(),
            OpKind::Delete { length } => *length,
        }
    }

    /// One past the last character this operation reads from the base text.
    pub fn end(&self) -> usize {
        match &self.kind {
            OpKind::Insert { .. } => self.position,
            OpKind::Delete { length } => self.position + length,
        }
    }

    /// An operation that leaves any text unchanged.
    ///
    /// Transformation can produce these (an insert swallowed by a concurrent
    /// delete, a delete fully covered by another); they are still applied and
    /// logged so that every accepted submission owns exactly one version.
    pub fn is_noop(&self) -> bool {
        self.span() == 0
    }

    /// Shape validation performed at the transport boundary.
    pub fn validate(&self) -> CollabResult<()> {
        match &self.kind {
            OpKind::Insert { text } if text.is_empty() => {
                Err(CollabError::Validation("insert text must not be empty".into()))
            }
            OpKind::Delete { length } if *length == 0 => {
                Err(CollabError::Validation("delete length must be positive".into()))
            }
            _ if self.user_id.is_empty() => {
                Err(CollabError::Validation("operation has no user id".into()))
            }
            _ => Ok(()),
        }
    }

    /// Deterministic order for concurrent inserts at the same position:
    /// earlier timestamp first, then user id, then text.
    pub fn tie_break(&self, other: &Operation) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.user_id.cmp(&other.user_id))
            .then_with(|| inserted_text(self).cmp(inserted_text(other)))
    }
}

fn inserted_text(op: &Operation) -> &str {
    match &op.kind {
        OpKind::Insert { text } => text,
        OpKind::Delete { .. } => "",
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_counts_chars_not_bytes() {
        let op = Operation::insert(0, "héllo✓", "u1", 1);
        assert_eq!(op.span(), 6);
        assert_eq!(op.end(), 0);

        let del = Operation::delete(3, 4, "u1", 1);
        assert_eq!(del.span(), 4);
        assert_eq!(del.end(), 7);
    }

    #[test]
    fn test_validate_rejects_empty_shapes() {
        assert!(Operation::insert(0, "", "u1", 1).validate().is_err());
        assert!(Operation::delete(0, 0, "u1", 1).validate().is_err());
        assert!(Operation::insert(0, "x", "", 1).validate().is_err());
        assert!(Operation::insert(4, "x", "u1", 1).validate().is_ok());
        assert!(Operation::delete(4, 2, "u1", 1).validate().is_ok());
    }

    #[test]
    fn test_tie_break_orders_by_timestamp_then_user() {
        let a = Operation::insert(0, "x", "A", 100);
        let b = Operation::insert(0, "y", "B", 100);
        let c = Operation::insert(0, "z", "A", 101);
        assert_eq!(a.tie_break(&b), Ordering::Less);
        assert_eq!(b.tie_break(&a), Ordering::Greater);
        assert_eq!(b.tie_break(&c), Ordering::Less);
    }

    #[test]
    fn test_noop_detection() {
        assert!(Operation::insert(2, "", "u", 0).is_noop());
        assert!(Operation::delete(2, 0, "u", 0).is_noop());
        assert!(!Operation::insert(2, "a", "u", 0).is_noop());
    }

    #[test]
    fn test_with_origin() {
        let op = Operation::insert(0, "a", "u", 0).with_origin(7);
        assert_eq!(op.origin_version, 7);
    }
}

//! Authoritative text and version of one document.

use crate::error::CollabResult;
use crate::operation::{DocumentId, OpKind, Operation, Version};
use crate::storage::Checkpoint;
use crate::transform::{apply, slice_chars};

/// Result of applying one operation to a [`DocumentState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Version the document moved to
    pub version: Version,
    /// Text removed by a delete, kept so the edit can be inverted later
    pub removed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentState {
    document_id: DocumentId,
    text: String,
    version: Version,
}

impl DocumentState {
    pub fn new(document_id: impl Into<DocumentId>) -> Self {
        Self {
            document_id: document_id.into(),
            text: String::new(),
            version: 0,
        }
    }

    /// Rehydrate from a persisted checkpoint.
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            document_id: checkpoint.document_id,
            text: checkpoint.text,
            version: checkpoint.version,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Length in characters.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Apply `op` and bump the version by exactly one.
    ///
    /// On error neither text nor version change.
    pub fn apply(&mut self, op: &Operation) -> CollabResult<Applied> {
        let next = apply(&self.text, op)?;
        let removed = match op.kind {
            OpKind::Delete { length } => Some(slice_chars(&self.text, op.position, length)),
            OpKind::Insert { .. } => None,
        };
        self.text = next;
        self.version += 1;
        Ok(Applied {
            version: self.version,
            removed,
        })
    }

    pub fn to_checkpoint(&self, saved_at: u64) -> Checkpoint {
        Checkpoint {
            document_id: self.document_id.clone(),
            text: self.text.clone(),
            version: self.version,
            saved_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollabError;

    #[test]
    fn test_apply_bumps_version() {
        let mut doc = DocumentState::new("doc");
        let applied = doc.apply(&Operation::insert(0, "Hello", "u1", 1)).unwrap();
        assert_eq!(applied, Applied { version: 1, removed: None });
        assert_eq!(doc.text(), "Hello");

        let applied = doc.apply(&Operation::delete(1, 3, "u1", 2)).unwrap();
        assert_eq!(applied.version, 2);
        assert_eq!(applied.removed.as_deref(), Some("ell"));
        assert_eq!(doc.text(), "Ho");
    }

    #[test]
    fn test_noop_still_consumes_version() {
        let mut doc = DocumentState::new("doc");
        doc.apply(&Operation::insert(0, "", "u1", 1)).unwrap();
        assert_eq!(doc.version(), 1);
        assert_eq!(doc.text(), "");
    }

    #[test]
    fn test_out_of_range_is_atomic() {
        let mut doc = DocumentState::new("doc");
        doc.apply(&Operation::insert(0, "abc", "u1", 1)).unwrap();

        let err = doc.apply(&Operation::delete(2, 5, "u1", 2)).unwrap_err();
        assert!(matches!(err, CollabError::OutOfRange { .. }));
        assert_eq!(doc.text(), "abc");
        assert_eq!(doc.version(), 1);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut doc = DocumentState::new("doc-7");
        doc.apply(&Operation::insert(0, "persist me", "u1", 1)).unwrap();

        let cp = doc.to_checkpoint(99);
        assert_eq!(cp.version, 1);
        assert_eq!(cp.saved_at, 99);

        let restored = DocumentState::from_checkpoint(cp);
        assert_eq!(restored, doc);
        assert_eq!(restored.char_len(), 10);
    }
}

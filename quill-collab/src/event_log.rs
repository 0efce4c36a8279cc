//! Append-only operation log used for catch-up transforms, recovery and
//! attribution.
//!
//! ```text
//!   base_version            last_version
//!        │                       │
//!        ▼                       ▼
//!   ─────┼────┬────┬────┬────┬───┤
//!  (ckpt)│ v+1│ v+2│ v+3│ ...│ vN│
//!   ─────┴────┴────┴────┴────┴───┘
//! ```
//!
//! Entry `i` carries the version the document reached when it was applied,
//! so the retained entries always cover `base_version + 1 ..= last_version`
//! without holes. A client whose known version lies in
//! `base_version ..= last_version` can be caught up by replay; anything
//! older needs a full snapshot.

use serde::{Deserialize, Serialize};

use crate::error::{CollabError, CollabResult};
use crate::operation::{Operation, UserId, Version};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Document version after this entry was applied
    pub version: Version,
    /// The operation exactly as applied (already transformed)
    pub op: Operation,
    pub timestamp: u64,
    /// Text removed by a delete; `None` for inserts
    pub removed: Option<String>,
}

/// Who changed what, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub user_id: UserId,
    pub op: Operation,
    pub timestamp: u64,
}

/// Full state handed to a client that cannot be caught up by replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySnapshot {
    pub text: String,
    pub version: Version,
    /// Retained history, compacted for display
    pub history: Vec<Operation>,
}

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    base_version: Version,
    entries: Vec<EventLogEntry>,
}

impl EventLog {
    /// Empty log starting after `base_version` (the loaded checkpoint).
    pub fn new(base_version: Version) -> Self {
        Self {
            base_version,
            entries: Vec::new(),
        }
    }

    pub fn base_version(&self) -> Version {
        self.base_version
    }

    pub fn last_version(&self) -> Version {
        self.base_version + self.entries.len() as Version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the next entry. Versions must be contiguous.
    pub fn append(&mut self, entry: EventLogEntry) -> CollabResult<()> {
        let expected = self.last_version() + 1;
        if entry.version != expected {
            return Err(CollabError::LogGap {
                expected,
                got: entry.version,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Entries with `from <= version <= to`, clamped to what is retained.
    pub fn slice(&self, from: Version, to: Version) -> &[EventLogEntry] {
        let start = from.max(self.base_version + 1);
        let end = to.min(self.last_version());
        if start > end {
            return &[];
        }
        let lo = (start - self.base_version - 1) as usize;
        let hi = (end - self.base_version) as usize;
        &self.entries[lo..hi]
    }

    pub fn get(&self, version: Version) -> Option<&EventLogEntry> {
        if version <= self.base_version {
            return None;
        }
        self.entries.get((version - self.base_version - 1) as usize)
    }

    /// Whether a client that last saw `version` can be caught up by replay.
    pub fn covers(&self, version: Version) -> bool {
        version >= self.base_version && version <= self.last_version()
    }

    /// Drop every entry older than `version`. Returns the number dropped.
    pub fn truncate_before(&mut self, version: Version) -> usize {
        if version <= self.base_version + 1 {
            return 0;
        }
        let drop = ((version - self.base_version - 1) as usize).min(self.entries.len());
        self.entries.drain(..drop);
        self.base_version += drop as Version;
        drop
    }

    /// Attribution tuples for every retained entry newer than `since`.
    pub fn entries_since(&self, since: Version) -> Vec<Attribution> {
        self.slice(since.saturating_add(1), Version::MAX)
            .iter()
            .map(|e| Attribution {
                user_id: e.op.user_id.clone(),
                op: e.op.clone(),
                timestamp: e.timestamp,
            })
            .collect()
    }

    /// Applied operations newer than `since`, in log order.
    pub fn operations_since(&self, since: Version) -> Vec<Operation> {
        self.slice(since.saturating_add(1), Version::MAX)
            .iter()
            .map(|e| e.op.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventLogEntry> {
        self.entries.iter()
    }
}

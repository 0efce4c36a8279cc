//! Session registry: who is in a document, where their cursor is, and how
//! to reach them.
//!
//! ## Architecture
//!
//! ```text
//! gateway connection ──owns──► mpsc::Sender<Arc<ServerEvent>>
//!                                      ▲
//!                                      │ downgrade()
//! SessionRegistry ──holds──► Participant { channel: WeakSender, … }
//! ```
//!
//! The registry only keeps a weak reference to each outbound channel, so a
//! dropped connection is detectable (`upgrade()` fails) and never kept
//! alive by presence bookkeeping. The coordinator's presence sweep removes
//! participants whose channel is gone or who have been silent for longer
//! than the presence timeout.
//!
//! Cursor state is best-effort: it is never transformed against edits and
//! carries no ordering guarantee relative to `document_change`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::operation::{now_millis, UserId};
use crate::protocol::{PresenceEntry, ServerEvent};

/// Selected character range `[start, end)`.
pub type Selection = (usize, usize);

/// Strong handle to a participant's outbound queue, owned by its connection.
pub type Outbound = mpsc::Sender<Arc<ServerEvent>>;

/// Registry's view of a connected participant.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub cursor: usize,
    pub selection: Option<Selection>,
    /// Identifies the connection that joined, so a stale connection's
    /// disconnect cannot remove a newer session for the same user
    pub connection_id: Uuid,
    last_seen: Instant,
    /// Wall-clock copy of `last_seen` for presence snapshots
    last_seen_millis: u64,
    channel: mpsc::WeakSender<Arc<ServerEvent>>,
}

impl Participant {
    fn new(user_id: UserId, display_name: String, channel: &Outbound, connection_id: Uuid) -> Self {
        Self {
            user_id,
            display_name,
            cursor: 0,
            selection: None,
            connection_id,
            last_seen: Instant::now(),
            last_seen_millis: now_millis(),
            channel: channel.downgrade(),
        }
    }

    /// Strong channel handle, if the connection still exists.
    pub fn channel(&self) -> Option<Outbound> {
        self.channel.upgrade()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.upgrade().is_some()
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_millis = now_millis();
    }

    fn entry(&self) -> PresenceEntry {
        PresenceEntry {
            user_id: self.user_id.clone(),
            username: self.display_name.clone(),
            cursor: self.cursor,
            selection: self.selection,
            last_seen: self.last_seen_millis,
        }
    }
}

/// Participants of one document, indexed by user id.
pub struct SessionRegistry {
    participants: HashMap<UserId, Participant>,
    presence_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(presence_timeout: Duration) -> Self {
        Self {
            participants: HashMap::new(),
            presence_timeout,
        }
    }

    /// Register (or re-register) a participant.
    ///
    /// Returns the replaced session when the same user joins again from a
    /// new connection.
    pub fn join(
        &mut self,
        user_id: &str,
        display_name: &str,
        channel: &Outbound,
        connection_id: Uuid,
    ) -> Option<Participant> {
        let participant = Participant::new(
            user_id.to_string(),
            display_name.to_string(),
            channel,
            connection_id,
        );
        self.participants.insert(user_id.to_string(), participant)
    }

    pub fn leave(&mut self, user_id: &str) -> Option<Participant> {
        self.participants.remove(user_id)
    }

    /// Remove `user_id` only if it is still bound to `connection_id`.
    pub fn disconnect(&mut self, user_id: &str, connection_id: Uuid) -> Option<Participant> {
        match self.participants.get(user_id) {
            Some(p) if p.connection_id == connection_id => self.participants.remove(user_id),
            _ => None,
        }
    }

    /// Refresh last-seen. Returns false for unknown users.
    pub fn mark_active(&mut self, user_id: &str) -> bool {
        match self.participants.get_mut(user_id) {
            Some(p) => {
                p.touch();
                true
            }
            None => false,
        }
    }

    pub fn update_cursor(
        &mut self,
        user_id: &str,
        position: usize,
        selection: Option<Selection>,
    ) -> CollabResult<()> {
        let p = self
            .participants
            .get_mut(user_id)
            .ok_or_else(|| CollabError::UnknownParticipant(user_id.to_string()))?;
        p.cursor = position;
        p.selection = selection;
        p.touch();
        Ok(())
    }

    /// Remove participants that timed out or whose connection is gone.
    pub fn sweep(&mut self, now: Instant) -> Vec<Participant> {
        let timeout = self.presence_timeout;
        let stale: Vec<UserId> = self
            .participants
            .iter()
            .filter(|(_, p)| p.is_idle(now, timeout) || !p.is_connected())
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|id| self.participants.remove(id))
            .collect()
    }

    /// Full presence snapshot, ordered by user id.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut users: Vec<PresenceEntry> = self.participants.values().map(Participant::entry).collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (Outbound, mpsc::Receiver<Arc<ServerEvent>>) {
        mpsc::channel(8)
    }

    #[test]
    fn test_join_and_leave() {
        let mut reg = SessionRegistry::new(Duration::from_secs(30));
        let (tx, _rx) = channel();

        assert!(reg.join("alice", "Alice", &tx, Uuid::new_v4()).is_none());
        assert!(reg.contains("alice"));
        assert_eq!(reg.len(), 1);

        let left = reg.leave("alice").unwrap();
        assert_eq!(left.display_name, "Alice");
        assert!(reg.is_empty());
        assert!(reg.leave("alice").is_none());
    }

    #[test]
    fn test_rejoin_replaces_and_stale_disconnect_is_ignored() {
        let mut reg = SessionRegistry::new(Duration::from_secs(30));
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        reg.join("alice", "Alice", &tx1, first);
        let replaced = reg.join("alice", "Alice", &tx2, second).unwrap();
        assert_eq!(replaced.connection_id, first);

        assert!(reg.disconnect("alice", first).is_none());
        assert!(reg.contains("alice"));
        assert!(reg.disconnect("alice", second).is_some());
        assert!(!reg.contains("alice"));
    }

    #[test]
    fn test_registry_holds_channel_weakly() {
        let mut reg = SessionRegistry::new(Duration::from_secs(30));
        let (tx, _rx) = channel();
        reg.join("bob", "Bob", &tx, Uuid::new_v4());

        assert!(reg.get("bob").unwrap().is_connected());
        drop(tx);
        assert!(!reg.get("bob").unwrap().is_connected());
        assert!(reg.get("bob").unwrap().channel().is_none());
    }

    #[test]
    fn test_sweep_removes_idle_and_dropped() {
        let mut reg = SessionRegistry::new(Duration::from_millis(100));
        let (tx_idle, _rx1) = channel();
        let (tx_live, _rx2) = channel();
        let (tx_gone, _rx3) = channel();

        reg.join("idle", "Idle", &tx_idle, Uuid::new_v4());
        reg.join("live", "Live", &tx_live, Uuid::new_v4());
        reg.join("gone", "Gone", &tx_gone, Uuid::new_v4());
        drop(tx_gone);

        let later = Instant::now() + Duration::from_millis(150);
        // "live" keeps talking; it is evaluated against the same clock
        // so push its last_seen forward manually.
        reg.participants.get_mut("live").unwrap().last_seen = later;

        let mut removed: Vec<UserId> = reg.sweep(later).into_iter().map(|p| p.user_id).collect();
        removed.sort();
        assert_eq!(removed, vec!["gone".to_string(), "idle".to_string()]);
        assert!(reg.contains("live"));
    }

    #[test]
    fn test_mark_active_and_cursor() {
        let mut reg = SessionRegistry::new(Duration::from_secs(30));
        let (tx, _rx) = channel();
        reg.join("carol", "Carol", &tx, Uuid::new_v4());

        let before = reg.get("carol").unwrap().last_seen();
        std::thread::sleep(Duration::from_millis(2));
        assert!(reg.mark_active("carol"));
        assert!(reg.get("carol").unwrap().last_seen() > before);
        assert!(!reg.mark_active("nobody"));

        reg.update_cursor("carol", 12, Some((10, 12))).unwrap();
        let p = reg.get("carol").unwrap();
        assert_eq!((p.cursor, p.selection), (12, Some((10, 12))));

        let err = reg.update_cursor("nobody", 1, None).unwrap_err();
        assert_eq!(err, CollabError::UnknownParticipant("nobody".into()));
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut reg = SessionRegistry::new(Duration::from_secs(30));
        let (tx, _rx) = channel();
        for user in ["zed", "amy", "kim"] {
            reg.join(user, &user.to_uppercase(), &tx, Uuid::new_v4());
        }
        let snapshot = reg.snapshot();
        assert_eq!(
            snapshot.iter().map(|e| e.user_id.as_str()).collect::<Vec<_>>(),
            vec!["amy", "kim", "zed"]
        );
        assert_eq!(snapshot[0].username, "AMY");
        assert!(snapshot[0].last_seen > 0);
    }
}

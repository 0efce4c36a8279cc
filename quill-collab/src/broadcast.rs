//! Fan-out of server events to a document's participants.
//!
//! Each participant has its own bounded outbound queue drained by its
//! connection task. Delivery is `try_send`: a full queue drops the event for
//! that participant only (it will notice the version gap and `recover`), and
//! the coordinator never waits on a slow peer.
//!
//! Counters are atomics so the hot path takes no lock; read them through
//! [`Broadcaster::stats`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;

use crate::presence::{Participant, SessionRegistry};
use crate::protocol::ServerEvent;

/// Snapshot of broadcast counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Queue full; the participant missed this event
    pub messages_dropped: u64,
    /// Connection already gone when we tried to deliver
    pub disconnected: u64,
}

/// Outcome of delivering one event to one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped,
    Disconnected,
}

#[derive(Default)]
pub struct Broadcaster {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    disconnected: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to a single participant.
    pub fn send_to(&self, participant: &Participant, event: Arc<ServerEvent>) -> Delivery {
        let Some(tx) = participant.channel() else {
            self.disconnected.fetch_add(1, Ordering::Relaxed);
            return Delivery::Disconnected;
        };

        match tx.try_send(event) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Outbound queue full for {}, dropping event",
                    participant.user_id
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                self.disconnected.fetch_add(1, Ordering::Relaxed);
                Delivery::Disconnected
            }
        }
    }

    /// Deliver `event` to every participant except `exclude`.
    ///
    /// Returns the number of participants that accepted it.
    pub fn broadcast(
        &self,
        registry: &SessionRegistry,
        event: ServerEvent,
        exclude: Option<&str>,
    ) -> usize {
        let event = Arc::new(event);
        registry
            .iter()
            .filter(|p| Some(p.user_id.as_str()) != exclude)
            .filter(|p| self.send_to(p, Arc::clone(&event)) == Delivery::Sent)
            .count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
        }
    }
}

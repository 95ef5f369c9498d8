//! Connection handles and bounded outbound queues.

use crate::event::{now_millis, ServerEvent};
use crate::registry::UserId;
use crate::room::RoomId;
use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::warn;
use uuid::Uuid;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Result of pushing one event to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued for the connection's writer.
    Delivered,
    /// The queue was full; the event was dropped and the connection flagged.
    Dropped,
    /// The connection is gone.
    Closed,
}

/// Aggregate result of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Connections the event was queued for.
    pub delivered: usize,
    /// Connections whose queue overflowed.
    pub dropped: usize,
}

impl Delivery {
    /// Fold one push outcome into the totals.
    pub fn record(&mut self, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Delivered => self.delivered += 1,
            PushOutcome::Dropped => self.dropped += 1,
            PushOutcome::Closed => {}
        }
    }

    /// Combine two fan-out results.
    #[must_use]
    pub fn merge(self, other: Delivery) -> Delivery {
        Delivery {
            delivered: self.delivered + other.delivered,
            dropped: self.dropped + other.dropped,
        }
    }
}

/// Bounded outbound queue of a single connection.
///
/// Pushing never blocks. When the queue is full the event is dropped, the
/// outbox is marked overflowed, and whoever waits on [`Outbox::overflowed`]
/// is woken so the connection can be torn down.
#[derive(Debug)]
pub struct Outbox {
    tx: mpsc::Sender<Arc<ServerEvent>>,
    overflowed: AtomicBool,
    dropped: AtomicU64,
    evict: Notify,
}

impl Outbox {
    /// Create an outbox and the receiver its connection drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<ServerEvent>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbox = Arc::new(Self {
            tx,
            overflowed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            evict: Notify::new(),
        });
        (outbox, rx)
    }

    /// Queue an event without waiting.
    pub fn push(&self, event: Arc<ServerEvent>) -> PushOutcome {
        match self.tx.try_send(event) {
            Ok(()) => PushOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if !self.overflowed.swap(true, Ordering::AcqRel) {
                    warn!(kind = %event.kind, "Outbound queue full, evicting connection");
                    self.evict.notify_one();
                }
                PushOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }

    /// Whether the queue has overflowed at least once.
    #[must_use]
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Number of events dropped because the queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until the queue overflows.
    pub async fn overflowed(&self) {
        if self.is_overflowed() {
            return;
        }
        self.evict.notified().await;
    }
}

/// One live transport connection as seen by the hub.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: Option<UserId>,
    joined_rooms: HashSet<RoomId>,
    outbox: Arc<Outbox>,
    connected_at: u64,
    closing: bool,
}

impl ConnectionHandle {
    /// Create a handle that is not yet bound to a user.
    #[must_use]
    pub fn new(id: ConnectionId, outbox: Arc<Outbox>) -> Self {
        Self {
            id,
            user_id: None,
            joined_rooms: HashSet::new(),
            outbox,
            connected_at: now_millis(),
            closing: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The owning user, once authenticated.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    #[must_use]
    pub fn joined_rooms(&self) -> &HashSet<RoomId> {
        &self.joined_rooms
    }

    #[must_use]
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    #[must_use]
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// Whether disconnect has started; no new rooms may be joined.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn bind_user(&mut self, user_id: &str) {
        self.user_id = Some(user_id.to_string());
    }

    pub(crate) fn joined_rooms_mut(&mut self) -> &mut HashSet<RoomId> {
        &mut self.joined_rooms
    }

    pub(crate) fn mark_closing(&mut self) {
        self.closing = true;
    }

    /// Push an event to this connection.
    pub fn push(&self, event: Arc<ServerEvent>) -> PushOutcome {
        self.outbox.push(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatwire_protocol::EventKind;
    use serde_json::json;

    fn event() -> Arc<ServerEvent> {
        Arc::new(ServerEvent::new(EventKind::UserTyping, json!({})))
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_outbox_overflow_flags_once() {
        let (outbox, mut rx) = Outbox::channel(2);

        assert_eq!(outbox.push(event()), PushOutcome::Delivered);
        assert_eq!(outbox.push(event()), PushOutcome::Delivered);
        assert!(!outbox.is_overflowed());

        assert_eq!(outbox.push(event()), PushOutcome::Dropped);
        assert_eq!(outbox.push(event()), PushOutcome::Dropped);
        assert!(outbox.is_overflowed());
        assert_eq!(outbox.dropped_count(), 2);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_outbox_closed_receiver() {
        let (outbox, rx) = Outbox::channel(4);
        drop(rx);
        assert_eq!(outbox.push(event()), PushOutcome::Closed);
    }

    #[tokio::test]
    async fn test_overflow_wakes_waiter() {
        let (outbox, _rx) = Outbox::channel(1);
        outbox.push(event());
        outbox.push(event());

        tokio::time::timeout(std::time::Duration::from_secs(1), outbox.overflowed())
            .await
            .expect("overflow notification");
    }

    #[test]
    fn test_delivery_totals() {
        let mut delivery = Delivery::default();
        delivery.record(PushOutcome::Delivered);
        delivery.record(PushOutcome::Dropped);
        delivery.record(PushOutcome::Closed);
        assert_eq!(delivery.delivered, 1);
        assert_eq!(delivery.dropped, 1);

        let total = delivery.merge(Delivery {
            delivered: 2,
            dropped: 0,
        });
        assert_eq!(total.delivered, 3);
    }
}

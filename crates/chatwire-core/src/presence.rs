//! Presence tracking for Chatwire.
//!
//! A user is online while the registry holds at least one connection for
//! them. The registry reports each edge crossing here, under the lock that
//! changed the user's connection set; the tracker de-duplicates, stamps
//! the time, and notifies subscribers. Offline edges also go to the store
//! feed, which never drops, so each one is persisted as `last_seen`.

use crate::event::{now_millis, ServerEvent};
use crate::registry::UserId;
use crate::store::StoreEvent;
use chatwire_protocol::EventKind;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::OnceLock;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Default capacity of the presence change stream.
const DEFAULT_CHANGE_CAPACITY: usize = 1024;

/// One online/offline edge of a user's aggregate presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceChange {
    /// User whose presence changed.
    pub user_id: UserId,
    /// New state.
    pub online: bool,
    /// When the edge was crossed. For an offline edge this is the user's
    /// last-seen time.
    pub at: u64,
}

impl PresenceChange {
    /// Build the event broadcast to every connection.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        if self.online {
            ServerEvent::new(EventKind::UserOnline, json!({ "user_id": self.user_id }))
        } else {
            ServerEvent::new(
                EventKind::UserOffline,
                json!({ "user_id": self.user_id, "last_seen": self.at }),
            )
        }
    }
}

/// Observes presence edges reported by the connection registry.
#[derive(Debug)]
pub struct PresenceTracker {
    /// Users last known to be online.
    online: DashSet<UserId>,
    /// Subscribers to presence edges. Slow subscribers may lag.
    changes: broadcast::Sender<PresenceChange>,
    store_feed: OnceLock<mpsc::UnboundedSender<StoreEvent>>,
}

impl PresenceTracker {
    /// Create a tracker with the default change-stream capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANGE_CAPACITY)
    }

    /// Create a tracker whose change stream buffers `capacity` edges.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            online: DashSet::new(),
            changes,
            store_feed: OnceLock::new(),
        }
    }

    /// Subscribe to presence edges.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes.subscribe()
    }

    /// Send every offline edge to `feed` as a last-seen record.
    ///
    /// Returns `false` if a feed is already attached.
    pub fn feed_store(&self, feed: mpsc::UnboundedSender<StoreEvent>) -> bool {
        self.store_feed.set(feed).is_ok()
    }

    /// Record an edge of `user_id`'s presence.
    ///
    /// Returns the change to broadcast, or `None` when the edge repeats the
    /// last known state.
    pub fn on_presence_change(&self, user_id: &str, is_online: bool) -> Option<PresenceChange> {
        let at = now_millis();
        let crossed = if is_online {
            self.online.insert(user_id.to_string())
        } else {
            self.online.remove(user_id).is_some()
        };

        if !crossed {
            debug!(user = %user_id, online = is_online, "Presence: duplicate edge ignored");
            return None;
        }

        debug!(user = %user_id, online = is_online, "Presence: edge");
        let change = PresenceChange {
            user_id: user_id.to_string(),
            online: is_online,
            at,
        };
        if !is_online {
            if let Some(feed) = self.store_feed.get() {
                let _ = feed.send(StoreEvent::LastSeen {
                    user_id: change.user_id.clone(),
                    at,
                });
            }
        }
        // No subscribers is fine.
        let _ = self.changes.send(change.clone());
        Some(change)
    }

    /// Last known presence bit for a user.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

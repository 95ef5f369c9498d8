//! The hub: one instance per process, owning every registry.
//!
//! Connection tasks hold an `Arc<Hub>` and call into it with their own
//! [`ConnectionId`]; the hub resolves the authenticated user, validates the
//! request and hands it to the relay or the call engine.

use crate::call::{CallConfig, CallError, CallId, CallRecord, CallSignalingEngine};
use crate::connection::{ConnectionId, Delivery, Outbox};
use crate::event::ServerEvent;
use crate::presence::PresenceTracker;
use crate::registry::{ConnectionRegistry, RegistryConfig, UserId};
use crate::relay::EventRelay;
use crate::room::{validate_room_id, RoomConfig, RoomError, RoomManager};
use crate::store::StoreEvent;
use chatwire_protocol::{CallType, EventKind, ReactionChange, ReadReceipt, SignalKind};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Reasons a client publish is refused.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The connection is unknown or has no user bound to it.
    #[error("Connection is not authenticated")]
    NotAuthenticated,

    /// Presence and call kinds only originate from the hub.
    #[error("Clients may not publish {0}")]
    NotPublishable(EventKind),

    /// The payload does not have the shape this kind requires.
    #[error("Invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid room ID: {0}")]
    InvalidRoom(&'static str),

    #[error("Invalid target user")]
    InvalidTarget,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_connections_per_user: usize,
    pub max_rooms_per_connection: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue_capacity: usize,
    pub ring_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: RegistryConfig::default().max_connections_per_user,
            max_rooms_per_connection: RoomConfig::default().max_rooms_per_connection,
            outbound_queue_capacity: 1024,
            ring_timeout: CallConfig::default().ring_timeout,
        }
    }
}

/// Point-in-time hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub users_online: usize,
    pub rooms: usize,
    pub memberships: usize,
    pub live_calls: usize,
}

/// Owns the registry, rooms, presence, relay and call engine.
pub struct Hub {
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) rooms: Arc<RoomManager>,
    presence: Arc<PresenceTracker>,
    relay: EventRelay,
    pub(crate) calls: Arc<CallSignalingEngine>,
    config: HubConfig,
}

impl Hub {
    /// Build a hub and all of its components.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        let presence = Arc::new(PresenceTracker::new());
        let registry = Arc::new(ConnectionRegistry::with_config(
            Arc::clone(&presence),
            RegistryConfig {
                max_connections_per_user: config.max_connections_per_user,
            },
        ));
        let rooms = Arc::new(RoomManager::with_config(
            Arc::clone(&registry),
            RoomConfig {
                max_rooms_per_connection: config.max_rooms_per_connection,
            },
        ));
        let relay = EventRelay::new(Arc::clone(&registry), Arc::clone(&rooms));
        let calls = Arc::new(CallSignalingEngine::with_config(
            Arc::clone(&registry),
            CallConfig {
                ring_timeout: config.ring_timeout,
                ..CallConfig::default()
            },
        ));

        Self {
            registry,
            rooms,
            presence,
            relay,
            calls,
            config,
        }
    }

    /// Create an outbound queue sized for this hub.
    #[must_use]
    pub fn open_outbox(&self) -> (Arc<Outbox>, mpsc::Receiver<Arc<ServerEvent>>) {
        Outbox::channel(self.config.outbound_queue_capacity)
    }

    /// Open the feed of last-seen times and terminal call records.
    ///
    /// The feed is unbounded and drops nothing. Only one feed exists per hub;
    /// later calls return `None`.
    #[must_use]
    pub fn open_store_feed(&self) -> Option<mpsc::UnboundedReceiver<StoreEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.presence.feed_store(tx.clone()) && self.calls.feed_store(tx)).then_some(rx)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    #[must_use]
    pub fn relay(&self) -> &EventRelay {
        &self.relay
    }

    #[must_use]
    pub fn calls(&self) -> &Arc<CallSignalingEngine> {
        &self.calls
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Subscribe a connection to a room.
    ///
    /// # Errors
    ///
    /// See [`RoomManager::join`].
    pub fn join_room(&self, connection_id: &ConnectionId, room_id: &str) -> Result<bool, RoomError> {
        self.rooms.join(room_id, connection_id)
    }

    /// Unsubscribe a connection from a room.
    pub fn leave_room(&self, connection_id: &ConnectionId, room_id: &str) -> bool {
        self.rooms.leave(room_id, connection_id)
    }

    /// Publish a chat event from a connection to a room.
    ///
    /// Reactions are stamped with the publisher's user ID, typing events
    /// with the typist and skip the publishing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not authenticated, the kind is
    /// hub-only, the room ID is invalid, or the payload is malformed.
    pub fn publish_room_event(
        &self,
        connection_id: &ConnectionId,
        room_id: &str,
        kind: EventKind,
        payload: Value,
    ) -> Result<Delivery, PublishError> {
        let user_id = self.authorize_publish(connection_id, kind)?;
        validate_room_id(room_id).map_err(PublishError::InvalidRoom)?;

        let payload = stamp_payload(kind, payload, &user_id)?;
        let event = ServerEvent::new(kind, payload).with_source(connection_id.clone());
        let exclude = kind.excludes_publisher().then_some(connection_id);

        let delivery = self.relay.publish_event_to_room(room_id, event, exclude);
        debug!(
            connection = %connection_id,
            room = %room_id,
            kind = %kind,
            recipients = delivery.delivered,
            "Room event published"
        );
        Ok(delivery)
    }

    /// Publish a chat event from a connection to every device of `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not authenticated, the kind is
    /// hub-only, the target is empty, or the payload is malformed.
    pub fn publish_user_event(
        &self,
        connection_id: &ConnectionId,
        target: &str,
        kind: EventKind,
        payload: Value,
    ) -> Result<Delivery, PublishError> {
        let user_id = self.authorize_publish(connection_id, kind)?;
        if target.is_empty() {
            return Err(PublishError::InvalidTarget);
        }

        let payload = stamp_payload(kind, payload, &user_id)?;
        let event = ServerEvent::new(kind, payload).with_source(connection_id.clone());
        let delivery = self.relay.publish_event_to_user(target, event);
        debug!(
            connection = %connection_id,
            target = %target,
            kind = %kind,
            recipients = delivery.delivered,
            "User event published"
        );
        Ok(delivery)
    }

    /// Ring `recipient` on behalf of the connection's user.
    ///
    /// # Errors
    ///
    /// See [`CallSignalingEngine::initiate`].
    pub fn initiate_call(
        &self,
        connection_id: &ConnectionId,
        recipient: &str,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        let caller = self.call_user(connection_id)?;
        self.calls
            .initiate(&caller, recipient, call_type, Some(connection_id.clone()))
    }

    /// Accept a call from this connection.
    ///
    /// # Errors
    ///
    /// See [`CallSignalingEngine::accept`].
    pub fn accept_call(
        &self,
        connection_id: &ConnectionId,
        call_id: &str,
    ) -> Result<CallRecord, CallError> {
        self.calls.accept(call_id, connection_id)
    }

    /// Decline a call as the connection's user.
    ///
    /// # Errors
    ///
    /// See [`CallSignalingEngine::decline`].
    pub fn decline_call(
        &self,
        connection_id: &ConnectionId,
        call_id: &str,
    ) -> Result<CallRecord, CallError> {
        let user = self.call_user(connection_id)?;
        self.calls.decline(call_id, &user, Some(connection_id))
    }

    /// End a call as the connection's user.
    ///
    /// # Errors
    ///
    /// See [`CallSignalingEngine::end`].
    pub fn end_call(
        &self,
        connection_id: &ConnectionId,
        call_id: &str,
        duration_seconds: u64,
    ) -> Result<CallRecord, CallError> {
        let user = self.call_user(connection_id)?;
        self.calls.end(call_id, &user, duration_seconds)
    }

    /// Relay a WebRTC signal from the connection's user to the other party.
    ///
    /// # Errors
    ///
    /// See [`CallSignalingEngine::relay_signal`].
    pub fn relay_signal(
        &self,
        connection_id: &ConnectionId,
        call_id: &str,
        kind: SignalKind,
        payload: Value,
    ) -> Result<Delivery, CallError> {
        let user = self.call_user(connection_id)?;
        self.calls.relay_signal(call_id, &user, kind, payload)
    }

    /// Current hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.connection_count(),
            users_online: self.registry.user_count(),
            rooms: self.rooms.room_count(),
            memberships: self.rooms.total_memberships(),
            live_calls: self.calls.live_count(),
        }
    }

    fn authorize_publish(
        &self,
        connection_id: &ConnectionId,
        kind: EventKind,
    ) -> Result<UserId, PublishError> {
        let user_id = self
            .registry
            .user_of(connection_id)
            .ok_or(PublishError::NotAuthenticated)?;
        if !kind.is_client_publishable() {
            return Err(PublishError::NotPublishable(kind));
        }
        Ok(user_id)
    }

    fn call_user(&self, connection_id: &ConnectionId) -> Result<UserId, CallError> {
        self.registry
            .user_of(connection_id)
            .ok_or_else(|| CallError::UnknownConnection(connection_id.clone()))
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

/// Fill in the publisher's identity where clients rely on it.
fn stamp_payload(kind: EventKind, payload: Value, user_id: &str) -> Result<Value, PublishError> {
    let invalid = |source| PublishError::InvalidPayload { kind, source };

    match kind {
        EventKind::MessageReacted => {
            let mut change: ReactionChange = serde_json::from_value(payload).map_err(invalid)?;
            change.user_id = Some(user_id.to_string());
            serde_json::to_value(change).map_err(invalid)
        }
        EventKind::MessageRead => {
            let mut receipt: ReadReceipt = serde_json::from_value(payload).map_err(invalid)?;
            receipt.reader_id = Some(user_id.to_string());
            serde_json::to_value(receipt).map_err(invalid)
        }
        EventKind::UserTyping | EventKind::UserStopTyping => {
            let mut fields = match payload {
                Value::Object(fields) => fields,
                _ => Map::new(),
            };
            fields.insert("user_id".to_string(), Value::String(user_id.to_string()));
            Ok(Value::Object(fields))
        }
        _ => Ok(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Rx = mpsc::Receiver<Arc<ServerEvent>>;

    fn connect(hub: &Hub, user: &str) -> (ConnectionId, Rx) {
        let (outbox, mut rx) = hub.open_outbox();
        let id = hub.on_connect(outbox, Some(user)).unwrap();
        while rx.try_recv().is_ok() {}
        (id, rx)
    }

    fn drain(rx: &mut Rx) -> Vec<Arc<ServerEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if !matches!(event.kind, EventKind::UserOnline | EventKind::UserOffline) {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn test_clients_cannot_publish_hub_kinds() {
        let hub = Hub::default();
        let (a, _rx) = connect(&hub, "alice");

        for kind in [EventKind::UserOnline, EventKind::IncomingCall, EventKind::ReceiveOffer] {
            assert!(matches!(
                hub.publish_room_event(&a, "R1", kind, json!({})),
                Err(PublishError::NotPublishable(_))
            ));
        }
    }

    #[test]
    fn test_anonymous_connection_cannot_publish() {
        let hub = Hub::default();
        let (outbox, _rx) = hub.open_outbox();
        let anon = hub.on_connect(outbox, None).unwrap();

        assert!(matches!(
            hub.publish_room_event(&anon, "R1", EventKind::ReceiveMessage, json!({})),
            Err(PublishError::NotAuthenticated)
        ));
        assert!(matches!(
            hub.initiate_call(&anon, "bob", CallType::Audio),
            Err(CallError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_reaction_is_stamped_with_reactor() {
        let hub = Hub::default();
        let (a, mut a_rx) = connect(&hub, "alice");
        let (b, _b_rx) = connect(&hub, "bob");
        hub.join_room(&a, "R1").unwrap();

        hub.publish_room_event(
            &b,
            "R1",
            EventKind::MessageReacted,
            json!({"message_id": "m1", "emoji": "👍", "user_id": "spoofed"}),
        )
        .unwrap();

        let got = drain(&mut a_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload["user_id"], "bob");
        assert_eq!(got[0].payload["emoji"], "👍");
    }

    #[test]
    fn test_malformed_reaction_rejected() {
        let hub = Hub::default();
        let (a, _rx) = connect(&hub, "alice");
        hub.join_room(&a, "R1").unwrap();

        assert!(matches!(
            hub.publish_room_event(&a, "R1", EventKind::MessageReacted, json!({"👍": 3})),
            Err(PublishError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_typing_skips_the_typist() {
        let hub = Hub::default();
        let (a, mut a_rx) = connect(&hub, "alice");
        let (b, mut b_rx) = connect(&hub, "bob");
        hub.join_room(&a, "R1").unwrap();
        hub.join_room(&b, "R1").unwrap();

        let delivery = hub
            .publish_room_event(&a, "R1", EventKind::UserTyping, Value::Null)
            .unwrap();
        assert_eq!(delivery.delivered, 1);
        assert!(drain(&mut a_rx).is_empty());

        let got = drain(&mut b_rx);
        assert_eq!(got[0].payload["user_id"], "alice");
    }

    #[test]
    fn test_read_receipt_to_user_carries_reader() {
        let hub = Hub::default();
        let (_a, mut a_rx) = connect(&hub, "alice");
        let (b, _b_rx) = connect(&hub, "bob");

        hub.publish_user_event(&b, "alice", EventKind::MessageRead, json!({"message_id": "m7"}))
            .unwrap();

        let got = drain(&mut a_rx);
        assert_eq!(got[0].kind, EventKind::MessageRead);
        assert_eq!(got[0].payload["reader_id"], "bob");
        assert_eq!(got[0].source.as_ref(), Some(&b));
    }

    #[test]
    fn test_publish_to_offline_user_is_not_an_error() {
        let hub = Hub::default();
        let (a, _rx) = connect(&hub, "alice");

        let delivery = hub
            .publish_user_event(&a, "nobody", EventKind::MessageDelivered, json!({"message_id": "m1"}))
            .unwrap();
        assert_eq!(delivery, Delivery::default());
    }

    #[tokio::test]
    async fn test_call_through_hub_binds_caller_connection() {
        let hub = Hub::default();
        let (a, _a_rx) = connect(&hub, "alice");
        let (b, _b_rx) = connect(&hub, "bob");

        let call_id = hub.initiate_call(&a, "bob", CallType::Video).unwrap();
        hub.accept_call(&b, &call_id).unwrap();
        assert_eq!(hub.stats().live_calls, 1);

        hub.on_disconnect(&a);
        assert_eq!(hub.stats().live_calls, 0);
        assert!(matches!(
            hub.end_call(&b, &call_id, 5),
            Err(CallError::CallClosed(_))
        ));
    }

    #[test]
    fn test_store_feed_keeps_every_offline_edge() {
        let hub = Hub::default();
        let mut feed = hub.open_store_feed().unwrap();
        assert!(hub.open_store_feed().is_none());

        for i in 0..1500 {
            let (id, _rx) = connect(&hub, &format!("user-{}", i));
            hub.on_disconnect(&id);
        }

        let mut last_seen = 0;
        while let Ok(event) = feed.try_recv() {
            assert!(matches!(event, StoreEvent::LastSeen { .. }));
            last_seen += 1;
        }
        assert_eq!(last_seen, 1500);
    }

    #[test]
    fn test_stats() {
        let hub = Hub::default();
        let (a1, _r1) = connect(&hub, "alice");
        let (a2, _r2) = connect(&hub, "alice");
        let (b, _r3) = connect(&hub, "bob");
        hub.join_room(&a1, "R1").unwrap();
        hub.join_room(&a2, "R1").unwrap();
        hub.join_room(&b, "R2").unwrap();

        assert_eq!(
            hub.stats(),
            HubStats {
                connections: 3,
                users_online: 2,
                rooms: 2,
                memberships: 3,
                live_calls: 0,
            }
        );
    }
}

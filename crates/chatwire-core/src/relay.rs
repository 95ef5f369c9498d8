//! Event fan-out for Chatwire.
//!
//! The relay delivers chat-domain events to the current members of a room
//! or to every connection of a user. Delivery is at-most-once to whoever is
//! connected at publish time: nothing is queued for absent targets, and a
//! full outbound queue drops the event for that connection only.

use crate::connection::{ConnectionId, Delivery};
use crate::event::ServerEvent;
use crate::registry::ConnectionRegistry;
use crate::room::RoomManager;
use chatwire_protocol::EventKind;
use serde_json::Value;
use std::sync::Arc;
use tracing::{trace, warn};

/// Fans out events to rooms and users.
///
/// Events published to one room from one task reach each member in
/// publish order; nothing is promised across rooms or across concurrent
/// publishers.
pub struct EventRelay {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
}

impl EventRelay {
    /// Create a relay over the given registry and rooms.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<RoomManager>) -> Self {
        Self { registry, rooms }
    }

    /// Deliver an event to every connection currently in `room_id`.
    pub fn publish_to_room(&self, room_id: &str, kind: EventKind, payload: Value) -> Delivery {
        self.publish_event_to_room(room_id, ServerEvent::new(kind, payload), None)
    }

    /// Deliver an event to every connection in `room_id` except `exclude`.
    pub fn publish_to_room_except(
        &self,
        room_id: &str,
        kind: EventKind,
        payload: Value,
        exclude: &ConnectionId,
    ) -> Delivery {
        self.publish_event_to_room(room_id, ServerEvent::new(kind, payload), Some(exclude))
    }

    /// Deliver a prepared event to a room.
    pub fn publish_event_to_room(
        &self,
        room_id: &str,
        event: ServerEvent,
        exclude: Option<&ConnectionId>,
    ) -> Delivery {
        let members = self.rooms.members_of(room_id);
        if members.is_empty() {
            trace!(room = %room_id, kind = %event.kind, "Publish to empty room");
            return Delivery::default();
        }

        let event = Arc::new(event.in_room(room_id));
        let mut delivery = Delivery::default();
        for connection_id in members {
            if exclude == Some(&connection_id) {
                continue;
            }
            delivery.record(
                self.registry
                    .push_to_connection(&connection_id, Arc::clone(&event)),
            );
        }

        if delivery.dropped > 0 {
            warn!(room = %room_id, kind = %event.kind, dropped = delivery.dropped, "Dropped events on full queues");
        }
        trace!(room = %room_id, kind = %event.kind, recipients = delivery.delivered, "Published to room");
        delivery
    }

    /// Deliver an event to every connection of `user_id`.
    pub fn publish_to_user(&self, user_id: &str, kind: EventKind, payload: Value) -> Delivery {
        self.publish_event_to_user(user_id, ServerEvent::new(kind, payload))
    }

    /// Deliver a prepared event to a user.
    pub fn publish_event_to_user(&self, user_id: &str, event: ServerEvent) -> Delivery {
        let kind = event.kind;
        let delivery = self.registry.push_to_user(user_id, Arc::new(event), None);
        if delivery.delivered == 0 && delivery.dropped == 0 {
            trace!(user = %user_id, kind = %kind, "User offline, event not delivered");
        } else {
            trace!(user = %user_id, kind = %kind, recipients = delivery.delivered, "Published to user");
        }
        delivery
    }
}

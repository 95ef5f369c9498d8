//! Rooms for Chatwire.
//!
//! A room is the set of connections currently subscribed to one chat or
//! group. Membership is per connection, so every device of a user joins
//! and leaves independently. Rooms exist only while they have members.

use crate::connection::ConnectionId;
use crate::registry::ConnectionRegistry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Maximum room ID length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// A room identifier (a chat or group ID from the store).
pub type RoomId = String;

/// Validate a room ID.
///
/// # Errors
///
/// Returns an error message if the room ID is invalid.
pub fn validate_room_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Room ID cannot be empty");
    }
    if id.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room ID too long");
    }
    if id.starts_with('$') {
        return Err("Room IDs starting with '$' are reserved");
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room ID contains invalid characters");
    }
    Ok(())
}

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Invalid room ID.
    #[error("Invalid room ID: {0}")]
    InvalidRoom(&'static str),

    /// The connection is not attached or is shutting down.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Maximum rooms per connection reached.
    #[error("Maximum rooms per connection reached")]
    MaxRoomsReached,
}

/// Room manager configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum rooms a single connection may be in.
    pub max_rooms_per_connection: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: 256,
        }
    }
}

/// The member set of one room.
#[derive(Debug, Default)]
pub struct Room {
    members: HashSet<ConnectionId>,
}

impl Room {
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Tracks which connections are subscribed to which rooms.
pub struct RoomManager {
    rooms: DashMap<RoomId, Room>,
    registry: Arc<ConnectionRegistry>,
    config: RoomConfig,
}

impl RoomManager {
    /// Create a room manager with default configuration.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_config(registry, RoomConfig::default())
    }

    /// Create a room manager with custom configuration.
    #[must_use]
    pub fn with_config(registry: Arc<ConnectionRegistry>, config: RoomConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            registry,
            config,
        }
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// Returns `true` if the connection was not already a member; joining
    /// twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the room ID is invalid, the connection is unknown
    /// or closing, or it is already in the maximum number of rooms.
    pub fn join(&self, room_id: &str, connection_id: &ConnectionId) -> Result<bool, RoomError> {
        validate_room_id(room_id).map_err(RoomError::InvalidRoom)?;

        // The handle stays locked while the room is updated so a concurrent
        // disconnect cannot miss this membership.
        let mut handle = self
            .registry
            .handle_mut(connection_id)
            .filter(|h| !h.is_closing())
            .ok_or_else(|| RoomError::UnknownConnection(connection_id.clone()))?;

        if handle.joined_rooms().contains(room_id) {
            return Ok(false);
        }
        if handle.joined_rooms().len() >= self.config.max_rooms_per_connection {
            return Err(RoomError::MaxRoomsReached);
        }

        handle.joined_rooms_mut().insert(room_id.to_string());
        let mut room = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            trace!(room = %room_id, "Creating room");
            Room::default()
        });
        room.members.insert(connection_id.clone());

        debug!(
            room = %room_id,
            connection = %connection_id,
            members = room.member_count(),
            "Joined room"
        );
        Ok(true)
    }

    /// Remove a connection from a room, deleting the room once empty.
    ///
    /// Returns `true` if the connection was a member; leaving a room one is
    /// not in is a no-op.
    pub fn leave(&self, room_id: &str, connection_id: &ConnectionId) -> bool {
        if let Some(mut handle) = self.registry.handle_mut(connection_id) {
            handle.joined_rooms_mut().remove(room_id);
        }

        let removed = self
            .rooms
            .get_mut(room_id)
            .map(|mut room| room.members.remove(connection_id))
            .unwrap_or(false);

        if self.rooms.remove_if(room_id, |_, room| room.is_empty()).is_some() {
            trace!(room = %room_id, "Deleted empty room");
        }

        if removed {
            debug!(room = %room_id, connection = %connection_id, "Left room");
        }
        removed
    }

    /// Snapshot of a room's member connections; empty if the room does not exist.
    #[must_use]
    pub fn members_of(&self, room_id: &str) -> HashSet<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Get the member count for a room.
    #[must_use]
    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|room| room.member_count())
            .unwrap_or(0)
    }

    /// Number of rooms with at least one member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total memberships across all rooms.
    #[must_use]
    pub fn total_memberships(&self) -> usize {
        self.rooms.iter().map(|room| room.member_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, Outbox};
    use crate::presence::PresenceTracker;

    fn setup(connections: &[&str]) -> (Arc<ConnectionRegistry>, RoomManager) {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(PresenceTracker::new())));
        for id in connections {
            let (outbox, _rx) = Outbox::channel(8);
            registry
                .attach(ConnectionHandle::new(ConnectionId::new(*id), outbox))
                .unwrap();
        }
        let rooms = RoomManager::new(Arc::clone(&registry));
        (registry, rooms)
    }

    #[test]
    fn test_room_id_validation() {
        assert!(validate_room_id("65f1c0ffee").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("$system").is_err());

        let long_id = "a".repeat(MAX_ROOM_ID_LENGTH + 1);
        assert!(validate_room_id(&long_id).is_err());
    }

    #[test]
    fn test_join_is_idempotent() {
        let (registry, rooms) = setup(&["c1"]);
        let c1 = ConnectionId::new("c1");

        assert!(rooms.join("chat-1", &c1).unwrap());
        assert!(!rooms.join("chat-1", &c1).unwrap());
        assert_eq!(rooms.member_count("chat-1"), 1);
        assert_eq!(registry.joined_rooms(&c1), vec!["chat-1".to_string()]);
    }

    #[test]
    fn test_join_leave_round_trip() {
        let (_registry, rooms) = setup(&["c1", "c2"]);
        let c1 = ConnectionId::new("c1");
        let c2 = ConnectionId::new("c2");

        rooms.join("chat-1", &c2).unwrap();
        let before = rooms.members_of("chat-1");

        rooms.join("chat-1", &c1).unwrap();
        assert!(rooms.leave("chat-1", &c1));
        assert_eq!(rooms.members_of("chat-1"), before);

        assert!(!rooms.leave("chat-1", &c1));
        assert_eq!(rooms.members_of("chat-1"), before);
    }

    #[test]
    fn test_empty_room_is_deleted() {
        let (_registry, rooms) = setup(&["c1"]);
        let c1 = ConnectionId::new("c1");

        rooms.join("chat-1", &c1).unwrap();
        assert!(rooms.room_exists("chat-1"));

        rooms.leave("chat-1", &c1);
        assert!(!rooms.room_exists("chat-1"));
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn test_memberships_are_per_connection() {
        let (registry, rooms) = setup(&["phone", "laptop"]);
        let phone = ConnectionId::new("phone");
        let laptop = ConnectionId::new("laptop");
        registry.register("alice", &phone).unwrap();
        registry.register("alice", &laptop).unwrap();

        rooms.join("chat-1", &phone).unwrap();
        rooms.join("chat-1", &laptop).unwrap();
        assert_eq!(rooms.member_count("chat-1"), 2);

        rooms.leave("chat-1", &phone);
        assert_eq!(
            rooms.members_of("chat-1"),
            HashSet::from([laptop.clone()])
        );
    }

    #[test]
    fn test_join_rejects_unknown_and_closing() {
        let (registry, rooms) = setup(&["c1"]);
        let c1 = ConnectionId::new("c1");

        assert!(matches!(
            rooms.join("chat-1", &ConnectionId::new("ghost")),
            Err(RoomError::UnknownConnection(_))
        ));

        registry.begin_close(&c1);
        assert!(matches!(
            rooms.join("chat-1", &c1),
            Err(RoomError::UnknownConnection(_))
        ));
        assert!(!rooms.room_exists("chat-1"));
    }

    #[test]
    fn test_max_rooms_per_connection() {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(PresenceTracker::new())));
        let (outbox, _rx) = Outbox::channel(8);
        let c1 = ConnectionId::new("c1");
        registry
            .attach(ConnectionHandle::new(c1.clone(), outbox))
            .unwrap();
        let rooms = RoomManager::with_config(
            registry,
            RoomConfig {
                max_rooms_per_connection: 2,
            },
        );

        rooms.join("a", &c1).unwrap();
        rooms.join("b", &c1).unwrap();
        assert!(!rooms.join("a", &c1).unwrap());
        assert!(matches!(
            rooms.join("c", &c1),
            Err(RoomError::MaxRoomsReached)
        ));
        assert_eq!(rooms.total_memberships(), 2);
    }
}

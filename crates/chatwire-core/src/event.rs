//! Outbound event type.
//!
//! A [`ServerEvent`] is created once per publish and shared by every
//! target connection through an `Arc`.

use crate::connection::ConnectionId;
use crate::room::RoomId;
use bytes::Bytes;
use chatwire_protocol::{codec, EventKind, Frame, ProtocolError};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique event identifier.
pub type EventId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique, monotonically increasing event ID.
#[must_use]
pub fn next_event_id() -> EventId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// An event pushed from the hub to connections.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    /// Unique event identifier.
    pub id: EventId,
    /// What happened.
    pub kind: EventKind,
    /// Room the event was published to, if room-scoped.
    pub room: Option<RoomId>,
    /// Event payload, relayed verbatim apart from sender stamping.
    pub payload: Value,
    /// Timestamp when the event was created.
    pub timestamp: u64,
    /// Publishing connection, if the event came from a client.
    pub source: Option<ConnectionId>,
    /// MessagePack encoding, computed once and shared by all targets.
    encoded: OnceLock<Bytes>,
}

impl ServerEvent {
    /// Create a new event.
    #[must_use]
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            id: next_event_id(),
            kind,
            room: None,
            payload,
            timestamp: now_millis(),
            source: None,
            encoded: OnceLock::new(),
        }
    }

    /// Scope the event to a room.
    #[must_use]
    pub fn in_room(mut self, room: impl Into<RoomId>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Record the publishing connection.
    #[must_use]
    pub fn with_source(mut self, source: ConnectionId) -> Self {
        self.source = Some(source);
        self
    }

    /// Build the wire frame for this event.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::Event {
            id: self.id,
            kind: self.kind,
            room: self.room.clone(),
            payload: self.payload.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Length-prefixed MessagePack encoding of the event frame.
    ///
    /// The first call encodes; later calls return the cached bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be encoded.
    pub fn encoded(&self) -> Result<Bytes, ProtocolError> {
        if let Some(bytes) = self.encoded.get() {
            return Ok(bytes.clone());
        }
        let bytes = codec::encode(&self.to_frame())?;
        let _ = self.encoded.set(bytes.clone());
        Ok(bytes)
    }
}

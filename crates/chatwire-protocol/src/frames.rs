//! Frame types for the Chatwire protocol.
//!
//! Frames are the fundamental unit of communication between a client and
//! the hub. Binary WebSocket messages carry MessagePack-encoded frames,
//! text messages carry JSON.

use crate::events::{CallType, EventKind, SignalKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes carried by [`Frame::Error`].
pub mod error_codes {
    pub const BAD_REQUEST: u16 = 1000;
    pub const UNSUPPORTED_VERSION: u16 = 1001;
    pub const NOT_AUTHENTICATED: u16 = 1002;
    pub const ROOM_ERROR: u16 = 1003;
    pub const PUBLISH_REJECTED: u16 = 1004;
    pub const CALL_REJECTED: u16 = 1005;
    pub const TOO_MANY_CONNECTIONS: u16 = 1006;
    pub const QUEUE_OVERFLOW: u16 = 1007;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    JoinRoom = 0x03,
    LeaveRoom = 0x04,
    PublishRoom = 0x05,
    PublishUser = 0x06,
    InitiateCall = 0x07,
    CallStarted = 0x08,
    AcceptCall = 0x09,
    DeclineCall = 0x0A,
    EndCall = 0x0B,
    Signal = 0x0C,
    Event = 0x0D,
    Ack = 0x0E,
    Error = 0x0F,
    Ping = 0x10,
    Pong = 0x11,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::JoinRoom),
            0x04 => Ok(FrameType::LeaveRoom),
            0x05 => Ok(FrameType::PublishRoom),
            0x06 => Ok(FrameType::PublishUser),
            0x07 => Ok(FrameType::InitiateCall),
            0x08 => Ok(FrameType::CallStarted),
            0x09 => Ok(FrameType::AcceptCall),
            0x0A => Ok(FrameType::DeclineCall),
            0x0B => Ok(FrameType::EndCall),
            0x0C => Ok(FrameType::Signal),
            0x0D => Ok(FrameType::Event),
            0x0E => Ok(FrameType::Ack),
            0x0F => Ok(FrameType::Error),
            0x10 => Ok(FrameType::Ping),
            0x11 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
///
/// The same enum is used in both directions; the hub rejects server-only
/// frames arriving from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Initial handshake. `user_id` is the identity already verified by the
    /// authentication layer in front of the hub.
    Connect {
        /// Protocol major version.
        version: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    /// Handshake accepted.
    Connected {
        connection_id: String,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Subscribe this connection to a room's events.
    JoinRoom { id: u64, room: String },

    /// Unsubscribe this connection from a room.
    LeaveRoom { id: u64, room: String },

    /// Publish a chat event to every connection in a room.
    PublishRoom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        room: String,
        kind: EventKind,
        #[serde(default)]
        payload: Value,
    },

    /// Publish a chat event to every connection of one user.
    PublishUser {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        target: String,
        kind: EventKind,
        #[serde(default)]
        payload: Value,
    },

    /// Start ringing another user.
    InitiateCall {
        id: u64,
        recipient: String,
        #[serde(default)]
        call_type: CallType,
    },

    /// Reply to `InitiateCall` carrying the new call identifier.
    CallStarted { id: u64, call_id: String },

    AcceptCall { id: u64, call_id: String },

    DeclineCall { id: u64, call_id: String },

    EndCall {
        id: u64,
        call_id: String,
        /// Call duration in seconds as measured by the client.
        #[serde(default)]
        duration: u64,
    },

    /// SDP offer/answer or ICE candidate, relayed verbatim to the other party.
    Signal {
        call_id: String,
        kind: SignalKind,
        #[serde(default)]
        payload: Value,
    },

    /// A push from the hub.
    Event {
        id: u64,
        kind: EventKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        #[serde(default)]
        payload: Value,
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },

    /// Acknowledgment of a request.
    Ack { id: u64 },

    /// Error response.
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        code: u16,
        message: String,
    },

    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::JoinRoom { .. } => FrameType::JoinRoom,
            Frame::LeaveRoom { .. } => FrameType::LeaveRoom,
            Frame::PublishRoom { .. } => FrameType::PublishRoom,
            Frame::PublishUser { .. } => FrameType::PublishUser,
            Frame::InitiateCall { .. } => FrameType::InitiateCall,
            Frame::CallStarted { .. } => FrameType::CallStarted,
            Frame::AcceptCall { .. } => FrameType::AcceptCall,
            Frame::DeclineCall { .. } => FrameType::DeclineCall,
            Frame::EndCall { .. } => FrameType::EndCall,
            Frame::Signal { .. } => FrameType::Signal,
            Frame::Event { .. } => FrameType::Event,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Whether only the hub may send this frame.
    #[must_use]
    pub fn is_server_frame(&self) -> bool {
        matches!(
            self,
            Frame::Connected { .. }
                | Frame::CallStarted { .. }
                | Frame::Event { .. }
                | Frame::Ack { .. }
                | Frame::Error { .. }
        )
    }

    /// Request ID carried by the frame, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::JoinRoom { id, .. }
            | Frame::LeaveRoom { id, .. }
            | Frame::InitiateCall { id, .. }
            | Frame::AcceptCall { id, .. }
            | Frame::DeclineCall { id, .. }
            | Frame::EndCall { id, .. } => Some(*id),
            Frame::PublishRoom { id, .. } | Frame::PublishUser { id, .. } => *id,
            _ => None,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, user_id: Option<String>) -> Self {
        Frame::Connect { version, user_id }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new JoinRoom frame.
    #[must_use]
    pub fn join_room(id: u64, room: impl Into<String>) -> Self {
        Frame::JoinRoom {
            id,
            room: room.into(),
        }
    }

    /// Create a new LeaveRoom frame.
    #[must_use]
    pub fn leave_room(id: u64, room: impl Into<String>) -> Self {
        Frame::LeaveRoom {
            id,
            room: room.into(),
        }
    }

    /// Create a new PublishRoom frame without acknowledgment.
    #[must_use]
    pub fn publish_room(room: impl Into<String>, kind: EventKind, payload: Value) -> Self {
        Frame::PublishRoom {
            id: None,
            room: room.into(),
            kind,
            payload,
        }
    }

    /// Create a new PublishUser frame without acknowledgment.
    #[must_use]
    pub fn publish_user(target: impl Into<String>, kind: EventKind, payload: Value) -> Self {
        Frame::PublishUser {
            id: None,
            target: target.into(),
            kind,
            payload,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_type() {
        let join = Frame::join_room(1, "chat-1");
        assert_eq!(join.frame_type(), FrameType::JoinRoom);

        let publish = Frame::publish_room("chat-1", EventKind::ReceiveMessage, json!({}));
        assert_eq!(publish.frame_type(), FrameType::PublishRoom);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x01), Ok(FrameType::Connect));
        assert_eq!(FrameType::try_from(0x0C), Ok(FrameType::Signal));
        assert_eq!(u8::from(FrameType::Pong), 0x11);
        assert!(FrameType::try_from(0x40).is_err());
    }

    #[test]
    fn test_json_shape() {
        let frame: Frame = serde_json::from_value(json!({
            "type": "signal",
            "call_id": "c-1",
            "kind": "ice_candidate",
            "payload": {"candidate": "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host"}
        }))
        .unwrap();

        match frame {
            Frame::Signal { call_id, kind, .. } => {
                assert_eq!(call_id, "c-1");
                assert_eq!(kind, SignalKind::IceCandidate);
            }
            other => panic!("Expected Signal, got {:?}", other),
        }
    }

    #[test]
    fn test_optional_fields_default() {
        let frame: Frame = serde_json::from_value(json!({
            "type": "initiate_call",
            "id": 7,
            "recipient": "bob"
        }))
        .unwrap();
        assert_eq!(
            frame,
            Frame::InitiateCall {
                id: 7,
                recipient: "bob".to_string(),
                call_type: CallType::Audio,
            }
        );

        let frame: Frame =
            serde_json::from_value(json!({"type": "connect", "version": 1})).unwrap();
        assert_eq!(frame, Frame::connect(1, None));
    }

    #[test]
    fn test_request_id_and_direction() {
        assert_eq!(Frame::join_room(3, "r").request_id(), Some(3));
        assert_eq!(
            Frame::publish_room("r", EventKind::UserTyping, Value::Null).request_id(),
            None
        );
        assert!(Frame::ack(1).is_server_frame());
        assert!(!Frame::ping().is_server_frame());
    }
}

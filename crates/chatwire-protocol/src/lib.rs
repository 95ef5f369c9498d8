//! # chatwire-protocol
//!
//! Wire protocol definitions for the Chatwire realtime messaging hub.
//!
//! This crate defines the frames exchanged between chat clients and the hub,
//! the kinds of events the hub pushes, and the codecs used on the wire.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake carrying the authenticated user
//! - `JoinRoom` / `LeaveRoom` - Per-connection room membership
//! - `PublishRoom` / `PublishUser` - Chat-domain events (messages, receipts, typing)
//! - `InitiateCall` / `AcceptCall` / `DeclineCall` / `EndCall` / `Signal` - Call signaling
//! - `Event` - A push from the hub to a connection
//! - `Ack` / `Error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use chatwire_protocol::{codec, EventKind, Frame};
//! use serde_json::json;
//!
//! let frame = Frame::publish_room("chat-42", EventKind::ReceiveMessage, json!({"text": "hi"}));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use events::{CallEndReason, CallType, EventKind, ReactionChange, ReadReceipt, SignalKind};
pub use frames::{error_codes, Frame, FrameType};
pub use version::{Version, PROTOCOL_VERSION};

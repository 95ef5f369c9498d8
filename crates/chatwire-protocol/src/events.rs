//! Event kinds and typed payloads.
//!
//! Payloads travel as opaque JSON values; the few shapes the hub has to
//! inspect or stamp (reactions, read receipts) are typed here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of an event pushed from the hub to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ReceiveMessage,
    MessageDelivered,
    MessageRead,
    MessageEdited,
    MessageDeleted,
    MessageReacted,
    UserTyping,
    UserStopTyping,
    UserOnline,
    UserOffline,
    IncomingCall,
    CallAccepted,
    CallAlreadyAcceptedElsewhere,
    CallDeclined,
    CallEnded,
    CallMissed,
    ReceiveOffer,
    ReceiveAnswer,
    ReceiveIceCandidate,
}

impl EventKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ReceiveMessage => "receive_message",
            EventKind::MessageDelivered => "message_delivered",
            EventKind::MessageRead => "message_read",
            EventKind::MessageEdited => "message_edited",
            EventKind::MessageDeleted => "message_deleted",
            EventKind::MessageReacted => "message_reacted",
            EventKind::UserTyping => "user_typing",
            EventKind::UserStopTyping => "user_stop_typing",
            EventKind::UserOnline => "user_online",
            EventKind::UserOffline => "user_offline",
            EventKind::IncomingCall => "incoming_call",
            EventKind::CallAccepted => "call_accepted",
            EventKind::CallAlreadyAcceptedElsewhere => "call_already_accepted_elsewhere",
            EventKind::CallDeclined => "call_declined",
            EventKind::CallEnded => "call_ended",
            EventKind::CallMissed => "call_missed",
            EventKind::ReceiveOffer => "receive_offer",
            EventKind::ReceiveAnswer => "receive_answer",
            EventKind::ReceiveIceCandidate => "receive_ice_candidate",
        }
    }

    /// Whether a client may publish this kind through `publish_room` / `publish_user`.
    ///
    /// Presence and call kinds only ever originate from the hub itself.
    #[must_use]
    pub fn is_client_publishable(&self) -> bool {
        matches!(
            self,
            EventKind::ReceiveMessage
                | EventKind::MessageDelivered
                | EventKind::MessageRead
                | EventKind::MessageEdited
                | EventKind::MessageDeleted
                | EventKind::MessageReacted
                | EventKind::UserTyping
                | EventKind::UserStopTyping
        )
    }

    /// Whether the publishing connection should be left out of a room fan-out.
    #[must_use]
    pub fn excludes_publisher(&self) -> bool {
        matches!(self, EventKind::UserTyping | EventKind::UserStopTyping)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media type of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    #[default]
    Audio,
    Video,
}

/// WebRTC signaling payload kinds relayed between call parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    /// The event kind the other party receives.
    #[must_use]
    pub fn event_kind(&self) -> EventKind {
        match self {
            SignalKind::Offer => EventKind::ReceiveOffer,
            SignalKind::Answer => EventKind::ReceiveAnswer,
            SignalKind::IceCandidate => EventKind::ReceiveIceCandidate,
        }
    }
}

/// Why a call reached the `ended` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    /// A participant hung up an active call.
    Hangup,
    /// The caller gave up while the call was still ringing.
    CallerCancel,
    /// A participant's connection went away mid-call.
    PeerDisconnect,
}

/// A reaction being set or cleared on a message.
///
/// `emoji: None` removes the user's reaction. The hub fills in `user_id`
/// from the authenticated connection before relaying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionChange {
    pub message_id: String,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A read receipt for one message by one reader.
///
/// Receivers de-duplicate on `(message_id, reader_id)`; redelivery is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_id: Option<String>,
}

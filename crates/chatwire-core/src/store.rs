//! Persistent store abstraction.
//!
//! The hub never owns durable state. The layer around it hands chat
//! events, delivery-state changes, terminal call records and last-seen
//! times to a [`ChatStore`] without waiting for the result before fan-out.

use crate::call::CallRecord;
use crate::event::now_millis;
use crate::registry::UserId;
use async_trait::async_trait;
use chatwire_protocol::EventKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the write.
    #[error("Store rejected write: {0}")]
    Rejected(String),
}

/// Delivery progress of one message for one recipient.
///
/// Only moves forward: `sent` → `delivered` → `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    /// Whether moving from `self` to `next` is progress.
    #[must_use]
    pub fn advances_to(&self, next: DeliveryState) -> bool {
        next > *self
    }
}

/// A chat message as handed to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub room: String,
    pub sender: UserId,
    pub payload: Value,
    pub timestamp: u64,
}

/// A hub-originated record bound for the store.
///
/// Carried on an unbounded feed (see [`crate::Hub::open_store_feed`]), so
/// a slow writer delays these records but never loses them.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A user's last connection closed.
    LastSeen { user_id: UserId, at: u64 },
    /// A call reached a terminal state.
    CallRecord(CallRecord),
}

impl StoreEvent {
    /// Perform the write.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn apply(&self, store: &dyn ChatStore) -> Result<(), StoreError> {
        match self {
            StoreEvent::LastSeen { user_id, at } => store.record_last_seen(user_id, *at).await,
            StoreEvent::CallRecord(record) => store.append_call_record(record).await,
        }
    }

    /// Store operation name for logs and metrics.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            StoreEvent::LastSeen { .. } => "record_last_seen",
            StoreEvent::CallRecord(_) => "append_call_record",
        }
    }
}

/// A durable backend for chat history.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Append a new message to a chat.
    async fn append_message(&self, record: MessageRecord) -> Result<(), StoreError>;

    /// Move a message's delivery state for one recipient forward.
    async fn update_delivery_state(
        &self,
        message_id: &str,
        recipient: &str,
        state: DeliveryState,
    ) -> Result<(), StoreError>;

    /// Append the final record of a call.
    async fn append_call_record(&self, record: &CallRecord) -> Result<(), StoreError>;

    /// Record when a user was last online.
    async fn record_last_seen(&self, user_id: &str, at: u64) -> Result<(), StoreError>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// A store write derived from a client publish.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    AppendMessage(MessageRecord),
    DeliveryState {
        message_id: String,
        recipient: UserId,
        state: DeliveryState,
    },
}

impl StoreWrite {
    /// The write a published chat event implies, if any.
    ///
    /// New messages are appended; delivery and read receipts advance the
    /// publisher's delivery state for the referenced message. Edits,
    /// deletes and reactions are persisted by the CRUD API before they
    /// reach the hub.
    #[must_use]
    pub fn for_publish(kind: EventKind, publisher: &str, room: Option<&str>, payload: &Value) -> Option<Self> {
        match kind {
            EventKind::ReceiveMessage => room.map(|room| {
                StoreWrite::AppendMessage(MessageRecord {
                    room: room.to_string(),
                    sender: publisher.to_string(),
                    payload: payload.clone(),
                    timestamp: now_millis(),
                })
            }),
            EventKind::MessageDelivered | EventKind::MessageRead => {
                let message_id = payload.get("message_id")?.as_str()?;
                let state = if kind == EventKind::MessageRead {
                    DeliveryState::Read
                } else {
                    DeliveryState::Delivered
                };
                Some(StoreWrite::DeliveryState {
                    message_id: message_id.to_string(),
                    recipient: publisher.to_string(),
                    state,
                })
            }
            _ => None,
        }
    }

    /// Perform the write.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub async fn apply(self, store: &dyn ChatStore) -> Result<(), StoreError> {
        match self {
            StoreWrite::AppendMessage(record) => store.append_message(record).await,
            StoreWrite::DeliveryState {
                message_id,
                recipient,
                state,
            } => {
                store
                    .update_delivery_state(&message_id, &recipient, state)
                    .await
            }
        }
    }
}

/// Store that only logs. Used when no durable backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStore;

#[async_trait]
impl ChatStore for LoggingStore {
    async fn append_message(&self, record: MessageRecord) -> Result<(), StoreError> {
        debug!(room = %record.room, user = %record.sender, "Store: append message");
        Ok(())
    }

    async fn update_delivery_state(
        &self,
        message_id: &str,
        recipient: &str,
        state: DeliveryState,
    ) -> Result<(), StoreError> {
        debug!(message = %message_id, user = %recipient, state = ?state, "Store: delivery state");
        Ok(())
    }

    async fn append_call_record(&self, record: &CallRecord) -> Result<(), StoreError> {
        debug!(
            call = %record.call_id,
            state = ?record.state,
            duration = record.duration_seconds,
            "Store: call record"
        );
        Ok(())
    }

    async fn record_last_seen(&self, user_id: &str, at: u64) -> Result<(), StoreError> {
        debug!(user = %user_id, at, "Store: last seen");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

/// In-process store keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

/// Contents of a [`MemoryStore`].
#[derive(Debug, Default, Clone)]
pub struct MemoryState {
    pub messages: Vec<MessageRecord>,
    pub delivery: Vec<(String, UserId, DeliveryState)>,
    pub calls: Vec<CallRecord>,
    pub last_seen: Vec<(UserId, u64)>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    #[must_use]
    pub fn snapshot(&self) -> MemoryState {
        self.state().clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn append_message(&self, record: MessageRecord) -> Result<(), StoreError> {
        self.state().messages.push(record);
        Ok(())
    }

    async fn update_delivery_state(
        &self,
        message_id: &str,
        recipient: &str,
        state: DeliveryState,
    ) -> Result<(), StoreError> {
        let mut inner = self.state();
        let current = inner
            .delivery
            .iter_mut()
            .find(|(m, r, _)| m == message_id && r == recipient);
        match current {
            Some((_, _, existing)) => {
                if existing.advances_to(state) {
                    *existing = state;
                }
            }
            None => inner
                .delivery
                .push((message_id.to_string(), recipient.to_string(), state)),
        }
        Ok(())
    }

    async fn append_call_record(&self, record: &CallRecord) -> Result<(), StoreError> {
        self.state().calls.push(record.clone());
        Ok(())
    }

    async fn record_last_seen(&self, user_id: &str, at: u64) -> Result<(), StoreError> {
        self.state().last_seen.push((user_id.to_string(), at));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

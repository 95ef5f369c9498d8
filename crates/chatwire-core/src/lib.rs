//! # chatwire-core
//!
//! The in-memory core of the Chatwire messaging hub.
//!
//! - **Registry** - Live connections per user, multi-device
//! - **Rooms** - Per-connection subscriptions to chats and groups
//! - **Presence** - Online/offline edges, emitted once per transition
//! - **Relay** - At-most-once fan-out to rooms and users
//! - **Calls** - Ringing/active/ended state machine and WebRTC signal relay
//! - **Hub** - Owns all of the above; connect/disconnect lifecycle
//!
//! ## Architecture
//!
//! ```text
//!                   ┌─────────────┐
//!   connection ────▶│     Hub     │
//!      task         └─────────────┘
//!                    │    │     │
//!          ┌─────────┘    │     └──────────┐
//!          ▼              ▼                ▼
//!   ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//!   │    Relay    │ │    Rooms    │ │    Calls    │
//!   └─────────────┘ └─────────────┘ └─────────────┘
//!          │              │                │
//!          └──────────────┼────────────────┘
//!                         ▼
//!                  ┌─────────────┐     ┌─────────────┐
//!                  │  Registry   │────▶│  Presence   │
//!                  └─────────────┘     └─────────────┘
//!                         │
//!                         ▼
//!                  per-connection Outbox
//! ```

pub mod call;
pub mod connection;
pub mod event;
pub mod hub;
pub mod lifecycle;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod room;
pub mod store;

pub use call::{CallError, CallId, CallRecord, CallSignalingEngine, CallState};
pub use connection::{ConnectionHandle, ConnectionId, Delivery, Outbox, PushOutcome};
pub use event::ServerEvent;
pub use hub::{Hub, HubConfig, HubStats, PublishError};
pub use presence::{PresenceChange, PresenceTracker};
pub use registry::{ConnectionRegistry, RegistryError, UserId};
pub use relay::EventRelay;
pub use room::{RoomError, RoomId, RoomManager};
pub use store::{
    ChatStore, DeliveryState, LoggingStore, MemoryStore, StoreError, StoreEvent, StoreWrite,
};

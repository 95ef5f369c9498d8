//! Connection registry.
//!
//! Tracks every live connection handle and, per user, the set of
//! connections they have open. Presence edges are reported to the
//! [`PresenceTracker`] while the user's entry is still locked, so two
//! connections closing at once can never both see themselves as the last.

use crate::connection::{ConnectionHandle, ConnectionId, Delivery, PushOutcome};
use crate::event::ServerEvent;
use crate::presence::PresenceTracker;
use crate::room::RoomId;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace};

/// A user identifier, as supplied by the authentication layer.
pub type UserId = String;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A handle with this ID is already attached.
    #[error("Connection already attached: {0}")]
    DuplicateConnection(ConnectionId),

    /// No handle with this ID is attached.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection is already bound to a different user.
    #[error("Connection {0} belongs to another user")]
    UserMismatch(ConnectionId),

    /// The user has reached their connection limit.
    #[error("Too many connections for user {0}")]
    TooManyConnections(UserId),
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum simultaneous connections per user.
    pub max_connections_per_user: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 16,
        }
    }
}

/// Per-user index of live connection handles.
pub struct ConnectionRegistry {
    /// Live handles indexed by connection ID.
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Connections per user.
    users: DashMap<UserId, HashSet<ConnectionId>>,
    /// Receives presence edges.
    presence: Arc<PresenceTracker>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new(presence: Arc<PresenceTracker>) -> Self {
        Self::with_config(presence, RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(presence: Arc<PresenceTracker>, config: RegistryConfig) -> Self {
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            presence,
            config,
        }
    }

    /// Take ownership of a freshly created handle.
    ///
    /// # Errors
    ///
    /// Returns an error if a handle with the same ID is already attached.
    pub fn attach(&self, handle: ConnectionHandle) -> Result<(), RegistryError> {
        match self.connections.entry(handle.id().clone()) {
            Entry::Occupied(o) => Err(RegistryError::DuplicateConnection(o.key().clone())),
            Entry::Vacant(v) => {
                trace!(connection = %handle.id(), "Attached connection");
                v.insert(handle);
                Ok(())
            }
        }
    }

    /// Add `connection_id` to `user_id`'s connection set.
    ///
    /// Returns `true` if the pair was new. Re-registering an existing pair
    /// is a no-op. The user's first connection emits an online edge.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not attached, belongs to a
    /// different user, or the user is at their connection limit.
    pub fn register(&self, user_id: &str, connection_id: &ConnectionId) -> Result<bool, RegistryError> {
        let mut conns = self.users.entry(user_id.to_string()).or_default();

        if conns.contains(connection_id) {
            return Ok(false);
        }

        let bound = match self.connections.get_mut(connection_id) {
            None => Err(RegistryError::UnknownConnection(connection_id.clone())),
            Some(mut handle) => {
                if handle.user_id().is_some_and(|owner| owner != user_id) {
                    Err(RegistryError::UserMismatch(connection_id.clone()))
                } else if conns.len() >= self.config.max_connections_per_user {
                    Err(RegistryError::TooManyConnections(user_id.to_string()))
                } else {
                    handle.bind_user(user_id);
                    Ok(())
                }
            }
        };

        if let Err(e) = bound {
            let empty = conns.is_empty();
            drop(conns);
            if empty {
                self.users.remove_if(user_id, |_, c| c.is_empty());
            }
            return Err(e);
        }

        let first = conns.is_empty();
        conns.insert(connection_id.clone());
        debug!(
            user = %user_id,
            connection = %connection_id,
            connections = conns.len(),
            "Registered connection"
        );

        if first {
            self.emit_presence(user_id, true);
        }

        Ok(true)
    }

    /// Remove a connection and return its handle.
    ///
    /// Unknown connections are ignored. Removing a user's last connection
    /// emits an offline edge.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<ConnectionHandle> {
        let (_, handle) = self.connections.remove(connection_id)?;

        if let Some(user_id) = handle.user_id() {
            match self.users.entry(user_id.to_string()) {
                Entry::Occupied(mut o) => {
                    if !o.get_mut().remove(connection_id) {
                        error!(user = %user_id, connection = %connection_id, "Reverse index mismatch");
                        debug_assert!(false, "connection missing from its user's set");
                    }
                    if o.get().is_empty() {
                        self.emit_presence(user_id, false);
                        o.remove();
                    }
                }
                Entry::Vacant(_) => {
                    error!(user = %user_id, connection = %connection_id, "Reverse index mismatch");
                    debug_assert!(false, "user entry missing for a bound connection");
                }
            }
        }

        debug!(connection = %connection_id, "Unregistered connection");
        Some(handle)
    }

    /// Mark a connection as closing and return the rooms it is in.
    ///
    /// Returns `None` if the connection is unknown.
    pub fn begin_close(&self, connection_id: &ConnectionId) -> Option<Vec<RoomId>> {
        let mut handle = self.connections.get_mut(connection_id)?;
        handle.mark_closing();
        Some(handle.joined_rooms().iter().cloned().collect())
    }

    /// Snapshot of a user's live connections; empty if they have none.
    #[must_use]
    pub fn connections_for(&self, user_id: &str) -> HashSet<ConnectionId> {
        self.users
            .get(user_id)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Whether the user has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.users.get(user_id).is_some_and(|c| !c.is_empty())
    }

    /// The user a connection belongs to.
    #[must_use]
    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.connections
            .get(connection_id)
            .and_then(|h| h.user_id().map(str::to_string))
    }

    /// Whether a handle with this ID is attached.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Rooms a connection is currently in.
    #[must_use]
    pub fn joined_rooms(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        self.connections
            .get(connection_id)
            .map(|h| h.joined_rooms().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn handle_mut(
        &self,
        connection_id: &ConnectionId,
    ) -> Option<RefMut<'_, ConnectionId, ConnectionHandle>> {
        self.connections.get_mut(connection_id)
    }

    /// Push an event to a single connection.
    pub fn push_to_connection(
        &self,
        connection_id: &ConnectionId,
        event: Arc<ServerEvent>,
    ) -> PushOutcome {
        match self.connections.get(connection_id) {
            Some(handle) => handle.push(event),
            None => PushOutcome::Closed,
        }
    }

    /// Push an event to every connection of a user, optionally skipping one.
    pub fn push_to_user(
        &self,
        user_id: &str,
        event: Arc<ServerEvent>,
        except: Option<&ConnectionId>,
    ) -> Delivery {
        let mut delivery = Delivery::default();
        for connection_id in self.connections_for(user_id) {
            if except == Some(&connection_id) {
                continue;
            }
            delivery.record(self.push_to_connection(&connection_id, Arc::clone(&event)));
        }
        delivery
    }

    /// Push an event to every live connection.
    pub fn broadcast(&self, event: Arc<ServerEvent>) -> Delivery {
        let mut delivery = Delivery::default();
        for handle in self.connections.iter() {
            delivery.record(handle.push(Arc::clone(&event)));
        }
        delivery
    }

    fn emit_presence(&self, user_id: &str, online: bool) {
        if let Some(change) = self.presence.on_presence_change(user_id, online) {
            let delivery = self.broadcast(Arc::new(change.to_event()));
            trace!(user = %user_id, online, recipients = delivery.delivered, "Broadcast presence");
        }
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of users with at least one live connection.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// The presence tracker this registry reports to.
    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }
}

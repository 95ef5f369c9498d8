//! Connect and disconnect hooks.

use crate::connection::{ConnectionHandle, ConnectionId, Outbox};
use crate::hub::Hub;
use crate::registry::RegistryError;
use std::sync::Arc;
use tracing::{debug, info};

impl Hub {
    /// Wire a new transport connection into the hub.
    ///
    /// With a `claimed_user` the connection is registered under that user
    /// (their first connection brings them online). Without one it stays
    /// anonymous: it can receive broadcasts but cannot publish or call.
    /// No rooms are joined automatically.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is at their connection limit; the
    /// connection is not kept in that case.
    pub fn on_connect(
        &self,
        outbox: Arc<Outbox>,
        claimed_user: Option<&str>,
    ) -> Result<ConnectionId, RegistryError> {
        let connection_id = ConnectionId::generate();
        self.registry
            .attach(ConnectionHandle::new(connection_id.clone(), outbox))?;

        if let Some(user_id) = claimed_user {
            if let Err(e) = self.registry.register(user_id, &connection_id) {
                self.registry.unregister(&connection_id);
                debug!(connection = %connection_id, user = %user_id, error = %e, "Connect refused");
                return Err(e);
            }
        }

        info!(
            connection = %connection_id,
            user = claimed_user.unwrap_or("-"),
            "Connection opened"
        );
        Ok(connection_id)
    }

    /// Tear a connection down.
    ///
    /// Leaves every room first, then ends calls bound to the connection,
    /// then unregisters it (possibly taking the user offline). Unknown or
    /// already-removed connections are ignored; returns whether anything
    /// was torn down.
    pub fn on_disconnect(&self, connection_id: &ConnectionId) -> bool {
        let Some(rooms) = self.registry.begin_close(connection_id) else {
            debug!(connection = %connection_id, "Disconnect of unknown connection ignored");
            return false;
        };

        for room_id in &rooms {
            self.rooms.leave(room_id, connection_id);
        }
        let ended_calls = self.calls.on_connection_closed(connection_id);

        let handle = self.registry.unregister(connection_id);
        info!(
            connection = %connection_id,
            user = handle.as_ref().and_then(|h| h.user_id()).unwrap_or("-"),
            rooms = rooms.len(),
            calls_ended = ended_calls.len(),
            "Connection closed"
        );
        handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use crate::hub::{Hub, HubConfig};
    use crate::registry::RegistryError;
    use chatwire_protocol::EventKind;

    #[test]
    fn test_connect_registers_user() {
        let hub = Hub::default();
        let (outbox, _rx) = hub.open_outbox();
        let id = hub.on_connect(outbox, Some("alice")).unwrap();

        assert!(hub.registry().is_online("alice"));
        assert!(hub.registry().joined_rooms(&id).is_empty());
    }

    #[test]
    fn test_disconnect_clears_rooms_before_offline() {
        let hub = Hub::default();
        let (outbox, _rx) = hub.open_outbox();
        let id = hub.on_connect(outbox, Some("alice")).unwrap();
        hub.join_room(&id, "R1").unwrap();
        hub.join_room(&id, "R2").unwrap();

        assert!(hub.on_disconnect(&id));
        assert_eq!(hub.rooms().room_count(), 0);
        assert!(!hub.registry().is_online("alice"));
        assert!(!hub.registry().contains(&id));

        assert!(!hub.on_disconnect(&id));
    }

    #[test]
    fn test_other_devices_keep_membership() {
        let hub = Hub::default();
        let (o1, _r1) = hub.open_outbox();
        let (o2, _r2) = hub.open_outbox();
        let phone = hub.on_connect(o1, Some("alice")).unwrap();
        let laptop = hub.on_connect(o2, Some("alice")).unwrap();
        hub.join_room(&phone, "R1").unwrap();
        hub.join_room(&laptop, "R1").unwrap();

        hub.on_disconnect(&phone);
        assert_eq!(hub.rooms().member_count("R1"), 1);
        assert!(hub.registry().is_online("alice"));
    }

    #[test]
    fn test_connection_limit_refuses_connect() {
        let hub = Hub::new(HubConfig {
            max_connections_per_user: 1,
            ..HubConfig::default()
        });
        let (o1, _r1) = hub.open_outbox();
        let (o2, _r2) = hub.open_outbox();
        hub.on_connect(o1, Some("alice")).unwrap();

        assert!(matches!(
            hub.on_connect(o2, Some("alice")),
            Err(RegistryError::TooManyConnections(_))
        ));
        assert_eq!(hub.registry().connection_count(), 1);
    }

    #[test]
    fn test_anonymous_connection_sees_presence() {
        let hub = Hub::default();
        let (outbox, mut rx) = hub.open_outbox();
        let anon = hub.on_connect(outbox, None).unwrap();
        assert_eq!(hub.registry().user_count(), 0);

        let (o2, _r2) = hub.open_outbox();
        hub.on_connect(o2, Some("bob")).unwrap();
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::UserOnline);

        assert!(hub.on_disconnect(&anon));
    }
}

//! Connection registry.
//!
//! Maps a logical identity to at most one live connection. Registration is
//! last-wins: a reconnect replaces the previous entry and the stale transport
//! is asked to close so silent reconnects never leak handles. Unregistration
//! is keyed by connection id so a late disconnect of a replaced connection
//! cannot evict its successor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// A frame on a connection's outbound channel.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A protocol event to serialize onto the socket.
    Event(ServerMessage),
    /// Directive to close the socket (the connection was replaced).
    Close,
}

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<Outbound>;

/// A live connection for one identity.
#[derive(Debug, Clone)]
pub struct Connection {
    pub conn_id: Uuid,
    pub sender: ClientSender,
    pub connected_at: DateTime<Utc>,
}

/// Identity → live connection map.
///
/// DashMap gives per-key atomicity on the register/unregister path; no other
/// state in the relay needs mutual exclusion.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Register a connection for `identity`, replacing any existing one.
    /// The replaced transport receives a best-effort `Close` directive.
    pub fn register(&self, identity: &str, conn_id: Uuid, sender: ClientSender) {
        let connection = Connection {
            conn_id,
            sender,
            connected_at: Utc::now(),
        };

        if let Some(stale) = self.connections.insert(identity.to_string(), connection) {
            tracing::info!(
                identity = identity,
                stale_conn = %stale.conn_id,
                "Replacing existing connection"
            );
            // Channel may already be closed if the old task is gone
            let _ = stale.sender.send(Outbound::Close);
        } else {
            tracing::info!(identity = identity, conn_id = %conn_id, "Client registered");
        }
    }

    /// Remove the entry for `identity` only if it still belongs to `conn_id`.
    /// Returns true if an entry was removed. Idempotent: disconnect events
    /// may race with a replacement registration.
    pub fn unregister(&self, identity: &str, conn_id: Uuid) -> bool {
        match self
            .connections
            .remove_if(identity, |_, conn| conn.conn_id == conn_id)
        {
            Some((_, conn)) => {
                tracing::info!(
                    identity = identity,
                    conn_id = %conn_id,
                    connected_secs = (Utc::now() - conn.connected_at).num_seconds(),
                    "Client unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// O(1) lookup of the live sender for an identity.
    pub fn lookup(&self, identity: &str) -> Option<ClientSender> {
        self.connections.get(identity).map(|c| c.sender.clone())
    }

    /// Send an event to an identity's live connection.
    /// Returns true if the event was handed to the transport.
    pub fn send(&self, identity: &str, message: ServerMessage) -> bool {
        match self.lookup(identity) {
            Some(sender) => sender.send(Outbound::Event(message)).is_ok(),
            None => false,
        }
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.connections.contains_key(identity)
    }

    pub fn online_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (ClientSender, mpsc::UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();

        registry.register("res-a", Uuid::new_v4(), tx);
        assert!(registry.is_online("res-a"));
        assert!(registry.lookup("res-a").is_some());
        assert_eq!(registry.online_count(), 1);
    }

    #[test]
    fn test_reregister_closes_stale_connection() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, _rx2) = channel();
        let c2 = Uuid::new_v4();

        registry.register("res-a", Uuid::new_v4(), tx1);
        registry.register("res-a", c2, tx2);

        // The first connection is told to close
        match rx1.try_recv().unwrap() {
            Outbound::Close => {}
            other => panic!("Expected Close, got {:?}", other),
        }

        // lookup now resolves to the second connection
        registry.send("res-a", ServerMessage::Pong);
        assert_eq!(registry.online_count(), 1);
        let stored = registry.connections.get("res-a").unwrap();
        assert_eq!(stored.conn_id, c2);
    }

    #[test]
    fn test_stale_unregister_does_not_evict_replacement() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        registry.register("res-a", c1, tx1);
        registry.register("res-a", c2, tx2);

        // The replaced connection's cleanup races in late: it must not
        // remove the new registration.
        assert!(!registry.unregister("res-a", c1));
        assert!(registry.is_online("res-a"));

        assert!(registry.unregister("res-a", c2));
        assert!(!registry.is_online("res-a"));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let c1 = Uuid::new_v4();

        registry.register("res-a", c1, tx);
        assert!(registry.unregister("res-a", c1));
        assert!(!registry.unregister("res-a", c1));
    }

    #[test]
    fn test_send_to_online_and_offline() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = channel();

        registry.register("res-a", Uuid::new_v4(), tx);
        assert!(registry.send("res-a", ServerMessage::Pong));
        match rx.try_recv().unwrap() {
            Outbound::Event(ServerMessage::Pong) => {}
            other => panic!("Expected Pong event, got {:?}", other),
        }

        assert!(!registry.send("res-nobody", ServerMessage::Pong));
    }

    #[test]
    fn test_send_fails_when_receiver_dropped() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = channel();
        drop(rx);

        registry.register("res-a", Uuid::new_v4(), tx);
        assert!(!registry.send("res-a", ServerMessage::Pong));
    }
}

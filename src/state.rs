//! Shared relay state and the dispatch layer.
//!
//! `RelayState` wires the connection registry, the message store, and the
//! call coordinator together and implements the relay policy: resolve the
//! target identity, forward if a live connection exists, otherwise persist
//! (chat) or fail fast (calls). Payloads are forwarded verbatim; the only
//! enrichment is routing metadata — sender identity and timestamps — carried
//! by the outbound event variants.
//!
//! Every method here is synchronous: registry sends are non-blocking channel
//! writes and store calls hold no lock across an await point.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::calls::CallCoordinator;
use crate::error::{RelayError, Result};
use crate::protocol::{CallEndReason, DeliveryStatus, ServerMessage, StoredMessage};
use crate::registry::{ClientSender, ConnectionRegistry, Outbound};
use crate::store::MessageStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// SQLite path for the message store; `None` runs in-memory.
    pub db_path: Option<PathBuf>,
    /// How long an unanswered call rings before timing out.
    pub ring_timeout_secs: u64,
    /// How long terminal call sessions linger before the cleanup task drops
    /// them (keeps late signals classifiable as stale).
    pub call_retention_secs: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: None,
            ring_timeout_secs: 30,
            call_retention_secs: 300,
            cleanup_interval_secs: 300,
        }
    }
}

/// Shared server state, cheap to clone.
#[derive(Clone)]
pub struct RelayState {
    pub registry: ConnectionRegistry,
    pub store: MessageStore,
    pub calls: CallCoordinator,
    pub config: RelayConfig,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let store = match &config.db_path {
            Some(path) => MessageStore::open(path)?,
            None => MessageStore::open_in_memory()?,
        };
        Ok(Self {
            registry: ConnectionRegistry::new(),
            store,
            calls: CallCoordinator::new(),
            config,
        })
    }

    // ── Connection Lifecycle ──────────────────────────────────────────────

    /// Register a connection and push the identity's undelivered backlog.
    ///
    /// The backlog is queued on the connection's own channel before the
    /// registry entry is inserted, so a live message racing the registration
    /// cannot end up on the wire ahead of an older queued message from the
    /// same sender. A second sweep after registration picks up anything
    /// persisted while the first push was in flight; a message that slips
    /// between the sweeps still arrives with its original `created_at`.
    ///
    /// A backlog persistence failure is logged but does not undo the
    /// registration; the messages simply stay `sent` for the next attempt.
    pub fn register_connection(&self, identity: &str, conn_id: Uuid, sender: ClientSender) {
        let mut delivered = self.push_backlog(identity, &sender);
        self.registry.register(identity, conn_id, sender.clone());
        delivered += self.push_backlog(identity, &sender);

        if delivered > 0 {
            tracing::debug!(identity = identity, count = delivered, "Delivered backlog");
        }
    }

    fn push_backlog(&self, identity: &str, sender: &ClientSender) -> usize {
        let backlog = match self.store.undelivered_for(identity) {
            Ok(backlog) => backlog,
            Err(e) => {
                tracing::error!(identity = identity, error = %e, "Backlog delivery failed");
                return 0;
            }
        };

        let mut delivered = 0;
        for message in backlog {
            if sender.send(Outbound::Event(message.to_event())).is_err() {
                // Connection died mid-push; the rest stays queued
                break;
            }
            self.finish_delivery(&message);
            delivered += 1;
        }
        delivered
    }

    /// Tear down a connection: drop the registry entry (conn-id guarded, so a
    /// replaced connection's late disconnect is a no-op) and, if the identity
    /// actually went offline, force-terminate its calls and notify each
    /// surviving party once.
    pub fn handle_disconnect(&self, identity: &str, conn_id: Uuid) {
        if !self.registry.unregister(identity, conn_id) {
            return;
        }

        for session in self.calls.end_all_for(identity) {
            if let Some(survivor) = session.counterpart(identity) {
                self.registry.send(
                    survivor,
                    ServerMessage::CallEnded {
                        call_id: session.call_id.clone(),
                        reason: CallEndReason::PeerDisconnected,
                    },
                );
            }
        }
    }

    // ── Chat ──────────────────────────────────────────────────────────────

    /// Persist a chat message and attempt immediate relay.
    ///
    /// The message is written with status `sent` first; only a successful
    /// forward advances it to `delivered`. If the forward fails the message
    /// stays `sent` — never lost, never falsely marked. Returns the stored
    /// record and whether it reached a live connection.
    pub fn send_chat(
        &self,
        from: &str,
        to: &str,
        text: Option<String>,
        media: Option<String>,
    ) -> Result<(StoredMessage, bool)> {
        let message = self.store.insert_sent(from, to, text, media)?;

        let delivered = self.registry.send(to, message.to_event());
        if delivered {
            self.finish_delivery(&message);
        } else {
            tracing::debug!(
                from = message.from.as_str(),
                to = message.to.as_str(),
                message_id = message.id.as_str(),
                "Recipient offline, message persisted as sent"
            );
        }

        Ok((message, delivered))
    }

    /// Mark a forwarded message delivered and tell its sender.
    ///
    /// The frame already reached the recipient, so a store failure here
    /// leaves the row at `sent` (the safe side) and is only logged.
    fn finish_delivery(&self, message: &StoredMessage) {
        match self.store.mark_delivered(&message.id) {
            Ok(true) => {
                self.registry.send(
                    &message.from,
                    ServerMessage::MessageStatus {
                        message_id: message.id.clone(),
                        status: DeliveryStatus::Delivered,
                    },
                );
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(
                    message_id = message.id.as_str(),
                    error = %e,
                    "Failed to record delivery"
                );
            }
        }
    }

    /// Bulk read receipt: `reader` opened the conversation with
    /// `counterparty`. Notifies the counterparty per message and returns how
    /// many messages moved.
    pub fn mark_read(&self, reader: &str, counterparty: &str) -> Result<usize> {
        let ids = self.store.mark_read(counterparty, reader)?;

        for message_id in &ids {
            self.registry.send(
                counterparty,
                ServerMessage::MessageStatus {
                    message_id: message_id.clone(),
                    status: DeliveryStatus::Read,
                },
            );
        }

        Ok(ids.len())
    }

    pub fn unread_count(&self, owner: &str, counterpart: &str) -> Result<i64> {
        self.store.unread_count(owner, counterpart)
    }

    // ── Calls ─────────────────────────────────────────────────────────────

    /// Start a call: verify the callee is reachable, open the session, relay
    /// the offer, and arm the ring timeout.
    ///
    /// An unreachable callee fails fast with `CalleeUnreachable` and leaves
    /// no ringing state behind.
    pub fn call_offer(&self, from: &str, to: &str, call_id: &str, sdp_offer: String) -> Result<()> {
        if !self.registry.is_online(to) {
            return Err(RelayError::CalleeUnreachable(to.to_string()));
        }

        self.calls.offer(call_id, from, to)?;

        let forwarded = self.registry.send(
            to,
            ServerMessage::CallOffer {
                from: from.to_string(),
                call_id: call_id.to_string(),
                sdp_offer,
            },
        );

        if !forwarded {
            // Callee vanished between the lookup and the forward
            self.calls.timeout_ring(call_id);
            return Err(RelayError::CalleeUnreachable(to.to_string()));
        }

        let state = self.clone();
        let call_id = call_id.to_string();
        let ring_timeout = Duration::from_secs(self.config.ring_timeout_secs);
        tokio::spawn(async move {
            tokio::time::sleep(ring_timeout).await;
            state.fire_ring_timeout(&call_id);
        });

        Ok(())
    }

    /// Ring-timeout expiry. A no-op unless the call is still ringing.
    fn fire_ring_timeout(&self, call_id: &str) {
        let Some(session) = self.calls.timeout_ring(call_id) else {
            return;
        };

        tracing::info!(call_id = call_id, "Call timed out unanswered");
        let notice = ServerMessage::CallEnded {
            call_id: session.call_id.clone(),
            reason: CallEndReason::TimedOut,
        };
        self.registry.send(&session.caller, notice.clone());
        // Also clear the callee's ringing UI
        self.registry.send(&session.callee, notice);
    }

    /// Relay an answer back to the caller. Stale or duplicate answers error
    /// and are not forwarded.
    pub fn call_answer(&self, from: &str, call_id: &str, sdp_answer: String) -> Result<()> {
        let session = self.calls.answer(call_id, from)?;

        let sent = self.registry.send(
            &session.caller,
            ServerMessage::CallAnswer {
                call_id: call_id.to_string(),
                sdp_answer,
            },
        );

        if !sent {
            // Caller dropped while the answer was in flight
            let _ = self.calls.end(call_id, &session.caller);
            return Err(RelayError::PeerDisconnected(call_id.to_string()));
        }

        Ok(())
    }

    /// Decline a ringing call; the caller sees a termination notice.
    pub fn call_reject(&self, from: &str, call_id: &str) -> Result<()> {
        let session = self.calls.reject(call_id, from)?;
        self.registry.send(
            &session.caller,
            ServerMessage::CallEnded {
                call_id: call_id.to_string(),
                reason: CallEndReason::Rejected,
            },
        );
        Ok(())
    }

    /// Hang up (or cancel a ringing offer); the counterpart is notified.
    pub fn call_end(&self, from: &str, call_id: &str) -> Result<()> {
        let session = self.calls.end(call_id, from)?;
        if let Some(counterpart) = session.counterpart(from) {
            self.registry.send(
                counterpart,
                ServerMessage::CallEnded {
                    call_id: call_id.to_string(),
                    reason: CallEndReason::Hangup,
                },
            );
        }
        Ok(())
    }

    /// Relay an ICE candidate to the counterpart while the call is live.
    /// Candidates for terminal or unknown calls are dropped silently — a race
    /// from network jitter, not an error.
    pub fn ice_candidate(&self, from: &str, call_id: &str, candidate: String) {
        match self.calls.ice_target(call_id, from) {
            Some(target) => {
                self.registry.send(
                    &target,
                    ServerMessage::IceCandidate {
                        call_id: call_id.to_string(),
                        candidate,
                    },
                );
            }
            None => {
                tracing::trace!(call_id = call_id, "Dropping late ICE candidate");
            }
        }
    }

    // ── Maintenance ───────────────────────────────────────────────────────

    /// Periodic cleanup: drop terminal call sessions past retention.
    pub fn cleanup_expired(&self) {
        self.calls.purge_terminal(self.config.call_retention_secs);
    }
}

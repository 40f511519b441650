//! Relay protocol message definitions.
//!
//! The relay speaks a simple JSON-over-WebSocket protocol.
//! SDP and ICE payloads are opaque to the relay — it forwards them verbatim
//! and never interprets media or session descriptions.

use serde::{Deserialize, Serialize};

// ── Delivery Status ───────────────────────────────────────────────────────────

/// Lifecycle status of a chat message.
///
/// Ordered as a monotonic lattice: `Sent < Delivered < Read`. A stored status
/// only ever moves forward; concurrent writers resolve to the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Whether moving from `self` to `to` is a legal (forward or equal) step.
    pub fn can_advance(self, to: DeliveryStatus) -> bool {
        to >= self
    }

    /// Integer encoding used by the message store.
    pub fn as_db(self) -> i64 {
        match self {
            DeliveryStatus::Sent => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
        }
    }

    /// Decode the store's integer encoding. Unknown values clamp to `Read`
    /// so a corrupt row can never regress a status.
    pub fn from_db(value: i64) -> DeliveryStatus {
        match value {
            0 => DeliveryStatus::Sent,
            1 => DeliveryStatus::Delivered,
            _ => DeliveryStatus::Read,
        }
    }
}

/// Why a call ended, as reported to the surviving party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    /// The callee explicitly declined.
    Rejected,
    /// Either party hung up.
    Hangup,
    /// Nobody answered within the ring timeout.
    TimedOut,
    /// The other party's connection dropped mid-call.
    PeerDisconnected,
}

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register this WebSocket connection with an identity.
    /// Must be sent first after connecting.
    Register {
        identity: String,
    },

    /// Send a chat message to another identity. At least one of `text` or
    /// `media` must be present.
    ChatMessage {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        /// URL of an already-uploaded attachment; the relay never sees blobs.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media: Option<String>,
    },

    /// Mark every message from `counterparty` addressed to this identity
    /// as read.
    MessageRead {
        counterparty: String,
    },

    /// Ask how many unread messages this identity has from `counterparty`.
    UnreadCount {
        counterparty: String,
    },

    /// Initiate a call: relay the SDP offer to `to` and start ringing.
    CallOffer {
        to: String,
        call_id: String,
        sdp_offer: String,
    },

    /// Accept a ringing call: relay the SDP answer back to the caller.
    CallAnswer {
        call_id: String,
        sdp_answer: String,
    },

    /// Decline a ringing call.
    CallReject {
        call_id: String,
    },

    /// Hang up (or cancel a still-ringing offer).
    CallEnd {
        call_id: String,
    },

    /// Relay a NAT-traversal candidate to the call counterpart.
    IceCandidate {
        call_id: String,
        candidate: String,
    },

    /// Ping to keep the connection alive.
    Ping,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgement of successful registration.
    Registered {
        identity: String,
    },

    /// A chat message delivered from another identity (live or from the
    /// undelivered backlog on reconnect).
    ChatMessage {
        id: String,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media: Option<String>,
        status: DeliveryStatus,
        created_at: i64,
    },

    /// Status-change notification to the original sender.
    MessageStatus {
        message_id: String,
        status: DeliveryStatus,
    },

    /// Answer to an `unread_count` query.
    UnreadCount {
        counterparty: String,
        count: i64,
    },

    /// An incoming call offer.
    CallOffer {
        from: String,
        call_id: String,
        sdp_offer: String,
    },

    /// The callee accepted; here is their SDP answer.
    CallAnswer {
        call_id: String,
        sdp_answer: String,
    },

    /// The call is over (declined, hung up, timed out, or peer dropped).
    CallEnded {
        call_id: String,
        reason: CallEndReason,
    },

    /// A NAT-traversal candidate forwarded from the counterpart.
    IceCandidate {
        call_id: String,
        candidate: String,
    },

    /// Pong response to keep the connection alive.
    Pong,

    /// Error response. `code` is one of the stable taxonomy codes
    /// (`InvalidMessage`, `PersistenceError`, `CalleeUnreachable`, …).
    Error {
        code: String,
        message: String,
    },
}

// ── Supporting Types ──────────────────────────────────────────────────────────

/// A persisted chat message record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub text: Option<String>,
    pub media: Option<String>,
    pub status: DeliveryStatus,
    /// Unix millis at persistence time.
    pub created_at: i64,
}

impl StoredMessage {
    /// The wire event delivered to the recipient.
    pub fn to_event(&self) -> ServerMessage {
        ServerMessage::ChatMessage {
            id: self.id.clone(),
            from: self.from.clone(),
            text: self.text.clone(),
            media: self.media.clone(),
            status: self.status,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lattice_ordering() {
        assert!(DeliveryStatus::Sent < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);

        assert!(DeliveryStatus::Sent.can_advance(DeliveryStatus::Read));
        assert!(DeliveryStatus::Delivered.can_advance(DeliveryStatus::Delivered));
        assert!(!DeliveryStatus::Read.can_advance(DeliveryStatus::Delivered));
        assert!(!DeliveryStatus::Read.can_advance(DeliveryStatus::Sent));
    }

    #[test]
    fn test_status_db_round_trip() {
        for status in [
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Read,
        ] {
            assert_eq!(DeliveryStatus::from_db(status.as_db()), status);
        }
        // Out-of-range values clamp forward, never backward
        assert_eq!(DeliveryStatus::from_db(99), DeliveryStatus::Read);
    }

    #[test]
    fn test_client_message_register_serialization() {
        let msg = ClientMessage::Register {
            identity: "res-6103".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"register\""));
        assert!(json.contains("res-6103"));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::Register { identity } => assert_eq!(identity, "res-6103"),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_message_chat_serialization() {
        let msg = ClientMessage::ChatMessage {
            to: "res-b".to_string(),
            text: Some("hi".to_string()),
            media: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"chat_message\""));
        // Absent media is omitted entirely
        assert!(!json.contains("media"));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::ChatMessage { to, text, media } => {
                assert_eq!(to, "res-b");
                assert_eq!(text.as_deref(), Some("hi"));
                assert!(media.is_none());
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_message_chat_media_only_parses() {
        let json =
            r#"{"type":"chat_message","to":"res-b","media":"https://cdn.example.com/x.jpg"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ClientMessage::ChatMessage { text, media, .. } => {
                assert!(text.is_none());
                assert_eq!(media.as_deref(), Some("https://cdn.example.com/x.jpg"));
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_message_call_offer_serialization() {
        let msg = ClientMessage::CallOffer {
            to: "sec-gate1".to_string(),
            call_id: "c1".to_string(),
            sdp_offer: "{\"sdp\":\"...\"}".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"call_offer\""));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::CallOffer {
                to,
                call_id,
                sdp_offer,
            } => {
                assert_eq!(to, "sec-gate1");
                assert_eq!(call_id, "c1");
                assert!(sdp_offer.contains("sdp"));
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_server_message_chat_serialization() {
        let msg = ServerMessage::ChatMessage {
            id: "m1".to_string(),
            from: "res-a".to_string(),
            text: Some("hello".to_string()),
            media: None,
            status: DeliveryStatus::Delivered,
            created_at: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"chat_message\""));
        assert!(json.contains("\"status\":\"delivered\""));
    }

    #[test]
    fn test_server_message_call_ended_serialization() {
        let msg = ServerMessage::CallEnded {
            call_id: "c1".to_string(),
            reason: CallEndReason::PeerDisconnected,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"call_ended\""));
        assert!(json.contains("\"reason\":\"peer_disconnected\""));
    }

    #[test]
    fn test_server_message_error_serialization() {
        let msg = ServerMessage::Error {
            code: "CalleeUnreachable".to_string(),
            message: "identity 'res-b' is not connected".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("CalleeUnreachable"));
    }

    #[test]
    fn test_stored_message_to_event() {
        let stored = StoredMessage {
            id: "m1".to_string(),
            from: "res-a".to_string(),
            to: "res-b".to_string(),
            text: Some("hi".to_string()),
            media: None,
            status: DeliveryStatus::Sent,
            created_at: 42,
        };
        match stored.to_event() {
            ServerMessage::ChatMessage {
                id,
                from,
                status,
                created_at,
                ..
            } => {
                assert_eq!(id, "m1");
                assert_eq!(from, "res-a");
                assert_eq!(status, DeliveryStatus::Sent);
                assert_eq!(created_at, 42);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_all_client_message_variants_round_trip() {
        let messages = vec![
            ClientMessage::Register {
                identity: "res-a".to_string(),
            },
            ClientMessage::ChatMessage {
                to: "res-b".to_string(),
                text: Some("hi".to_string()),
                media: Some("https://cdn.example.com/x.jpg".to_string()),
            },
            ClientMessage::MessageRead {
                counterparty: "res-a".to_string(),
            },
            ClientMessage::UnreadCount {
                counterparty: "res-a".to_string(),
            },
            ClientMessage::CallOffer {
                to: "res-b".to_string(),
                call_id: "c1".to_string(),
                sdp_offer: "offer".to_string(),
            },
            ClientMessage::CallAnswer {
                call_id: "c1".to_string(),
                sdp_answer: "answer".to_string(),
            },
            ClientMessage::CallReject {
                call_id: "c1".to_string(),
            },
            ClientMessage::CallEnd {
                call_id: "c1".to_string(),
            },
            ClientMessage::IceCandidate {
                call_id: "c1".to_string(),
                candidate: "candidate:0 1 UDP ...".to_string(),
            },
            ClientMessage::Ping,
        ];

        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2);
        }
    }
}

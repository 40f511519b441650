//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: parsing client messages,
//! routing them through the relay state, and sending responses.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{ClientSender, Outbound};
use crate::state::RelayState;

/// Identities come from the portal's auth layer and are opaque here; the
/// relay only refuses blank ones.
fn valid_identity(identity: &str) -> bool {
    !identity.trim().is_empty()
}

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Waits for a `Register` message to associate the connection with an
///    identity
/// 2. Spawns a sender task to forward outbound frames (and close the socket
///    if the registry replaces this connection)
/// 3. Processes incoming messages until the connection closes
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: Wait for Registration ─────────────────────────────────────

    let identity = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Register { identity }) => {
                        if !valid_identity(&identity) {
                            let err = ServerMessage::Error {
                                code: "InvalidMessage".to_string(),
                                message: "identity must not be empty".to_string(),
                            };
                            let _ = ws_sender
                                .send(Message::Text(serde_json::to_string(&err).unwrap()))
                                .await;
                            continue;
                        }

                        let ack = ServerMessage::Registered {
                            identity: identity.clone(),
                        };
                        if ws_sender
                            .send(Message::Text(serde_json::to_string(&ack).unwrap()))
                            .await
                            .is_err()
                        {
                            return; // Connection closed
                        }

                        break identity;
                    }
                    Ok(ClientMessage::Ping) => {
                        let pong = ServerMessage::Pong;
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&pong).unwrap()))
                            .await;
                    }
                    Ok(_) => {
                        let err = ServerMessage::Error {
                            code: "InvalidMessage".to_string(),
                            message: "must register before sending other messages".to_string(),
                        };
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&err).unwrap()))
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to parse client message");
                        let err = ServerMessage::Error {
                            code: "InvalidMessage".to_string(),
                            message: format!("invalid message format: {}", e),
                        };
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&err).unwrap()))
                            .await;
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return; // Connection closed before registration
            }
            _ => continue,
        }
    };

    // ── Step 2: Register Connection ───────────────────────────────────────

    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    // Also pushes any undelivered backlog into the outbound channel
    state.register_connection(&identity, conn_id, tx.clone());

    // ── Step 3: Spawn Sender Task ─────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Event(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break; // Connection closed
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize server message");
                    }
                },
                Outbound::Close => {
                    // This connection was replaced by a newer registration
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // ── Step 4: Process Messages ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    handle_client_message(&state, &identity, &tx, client_msg);
                }
                Err(e) => {
                    tracing::warn!(
                        identity = identity.as_str(),
                        error = %e,
                        "Failed to parse client message"
                    );
                    let _ = tx.send(Outbound::Event(ServerMessage::Error {
                        code: "InvalidMessage".to_string(),
                        message: format!("invalid message format: {}", e),
                    }));
                }
            },
            Ok(Message::Ping(_)) => {
                let _ = tx.send(Outbound::Event(ServerMessage::Pong));
            }
            Ok(Message::Close(_)) => {
                tracing::info!(identity = identity.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    identity = identity.as_str(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            _ => {} // Binary, Pong — ignore
        }
    }

    // ── Step 5: Cleanup ───────────────────────────────────────────────────

    // Conn-id guarded: if this connection was replaced, neither the registry
    // entry nor any in-progress call belonging to the identity is touched.
    state.handle_disconnect(&identity, conn_id);
    sender_task.abort();
    tracing::info!(identity = identity.as_str(), "WebSocket disconnected");
}

/// Handle a parsed client message. Dispatch failures are reported back to the
/// originating client as `error {code, message}` events and never partially
/// applied.
///
/// Replies go through `reply` — this connection's own channel — rather than a
/// registry lookup, so a frame from a connection a silent reconnect has
/// already replaced is answered on the socket that sent it, not on its
/// replacement.
fn handle_client_message(state: &RelayState, from: &str, reply: &ClientSender, msg: ClientMessage) {
    let reply_event = |event: ServerMessage| {
        let _ = reply.send(Outbound::Event(event));
    };

    match msg {
        ClientMessage::Register { .. } => {
            reply_event(ServerMessage::Error {
                code: "InvalidMessage".to_string(),
                message: "already registered".to_string(),
            });
        }

        ClientMessage::ChatMessage { to, text, media } => {
            if let Err(e) = state.send_chat(from, &to, text, media) {
                reply_event(e.to_event());
            }
        }

        ClientMessage::MessageRead { counterparty } => {
            match state.mark_read(from, &counterparty) {
                Ok(count) => {
                    tracing::debug!(
                        reader = from,
                        counterparty = counterparty.as_str(),
                        count = count,
                        "Conversation marked read"
                    );
                }
                Err(e) => {
                    reply_event(e.to_event());
                }
            }
        }

        ClientMessage::UnreadCount { counterparty } => {
            match state.unread_count(from, &counterparty) {
                Ok(count) => {
                    reply_event(ServerMessage::UnreadCount {
                        counterparty,
                        count,
                    });
                }
                Err(e) => {
                    reply_event(e.to_event());
                }
            }
        }

        ClientMessage::CallOffer {
            to,
            call_id,
            sdp_offer,
        } => {
            if let Err(e) = state.call_offer(from, &to, &call_id, sdp_offer) {
                reply_event(e.to_event());
            }
        }

        ClientMessage::CallAnswer {
            call_id,
            sdp_answer,
        } => {
            if let Err(e) = state.call_answer(from, &call_id, sdp_answer) {
                reply_event(e.to_event());
            }
        }

        ClientMessage::CallReject { call_id } => {
            if let Err(e) = state.call_reject(from, &call_id) {
                reply_event(e.to_event());
            }
        }

        ClientMessage::CallEnd { call_id } => {
            if let Err(e) = state.call_end(from, &call_id) {
                reply_event(e.to_event());
            }
        }

        ClientMessage::IceCandidate { call_id, candidate } => {
            // Late or unroutable candidates get no error reply
            state.ice_candidate(from, &call_id, candidate);
        }

        ClientMessage::Ping => {
            reply_event(ServerMessage::Pong);
        }
    }
}

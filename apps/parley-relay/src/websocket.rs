use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_proto::Envelope;

use crate::registry::{ConnectionRegistry, Outbound, RegistryError, SessionHandle};

/// Shared state for the signaling endpoint.
#[derive(Clone)]
pub struct RelayState {
    registry: Arc<ConnectionRegistry>,
    send_queue_depth: usize,
}

impl RelayState {
    pub fn new(registry: Arc<ConnectionRegistry>, send_queue_depth: usize) -> Self {
        Self {
            registry,
            send_queue_depth,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }
}

/// WebSocket upgrade handler. The room is part of the address, never
/// the envelope.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, state))
}

/// Per-connection worker: a reader loop here plus a writer task fed by
/// a bounded queue. The session id binds on the first `join` and stays
/// bound for the connection's lifetime.
async fn handle_socket(socket: WebSocket, room_id: String, state: RelayState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.send_queue_depth);

    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut session_id: Option<String> = None;

    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                debug!(room = %room_id, %err, "websocket read error");
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Ping/pong are handled by axum; binary frames are not part
            // of the protocol.
            _ => continue,
        };

        let envelope = match serde_json::from_str::<Envelope>(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(room = %room_id, %err, "dropping malformed envelope");
                continue;
            }
        };

        match envelope {
            Envelope::Join { sender_id } => match &session_id {
                Some(bound) if *bound == sender_id => {
                    debug!(room = %room_id, session = %sender_id, "duplicate join ignored");
                }
                Some(bound) => {
                    warn!(
                        room = %room_id,
                        bound = %bound,
                        claimed = %sender_id,
                        "join with mismatched sender id dropped"
                    );
                }
                None => {
                    let handle = SessionHandle::new(tx.clone());
                    match state.registry.register(&room_id, &sender_id, handle) {
                        Ok(()) => {
                            info!(room = %room_id, session = %sender_id, "session joined");
                            announce_join(&state, &room_id, &sender_id);
                            session_id = Some(sender_id);
                        }
                        Err(RegistryError::DuplicateSession(_)) => {
                            warn!(
                                room = %room_id,
                                session = %sender_id,
                                "duplicate session id; rejecting connection"
                            );
                            let _ = tx.try_send(Outbound::Close {
                                code: close_code::POLICY,
                                reason: "duplicate session id",
                            });
                            break;
                        }
                    }
                }
            },
            Envelope::Leave { sender_id } => match session_id.take() {
                Some(bound) if bound == sender_id => {
                    depart(&state, &room_id, &bound);
                    let _ = tx.try_send(Outbound::Close {
                        code: close_code::NORMAL,
                        reason: "left",
                    });
                    break;
                }
                other => {
                    warn!(room = %room_id, claimed = %sender_id, "unbound leave dropped");
                    session_id = other;
                }
            },
            envelope @ (Envelope::Offer { .. }
            | Envelope::Answer { .. }
            | Envelope::IceCandidate { .. }) => match &session_id {
                None => {
                    warn!(
                        room = %room_id,
                        kind = envelope.kind(),
                        "envelope before join dropped"
                    );
                }
                Some(bound) if envelope.sender_id() != bound => {
                    warn!(
                        room = %room_id,
                        bound = %bound,
                        claimed = %envelope.sender_id(),
                        "envelope with mismatched sender id dropped"
                    );
                }
                Some(_) => {
                    if let Some(target) = envelope.target_id() {
                        // Forward the frame as received so the payload
                        // reaches the target byte-identical.
                        forward(&state, &room_id, target, &text);
                    }
                }
            },
        }
    }

    // Abrupt disconnect and explicit leave share this path; unregister
    // is idempotent so the broadcast happens exactly once.
    if let Some(bound) = session_id {
        depart(&state, &room_id, &bound);
    }

    drop(tx);
    let _ = writer.await;
}

fn announce_join(state: &RelayState, room_id: &str, session_id: &str) {
    if let Ok(frame) = serde_json::to_string(&Envelope::Join {
        sender_id: session_id.to_string(),
    }) {
        broadcast_from(state, room_id, session_id, &frame);
    }
}

fn announce_leave(state: &RelayState, room_id: &str, session_id: &str) {
    if let Ok(frame) = serde_json::to_string(&Envelope::Leave {
        sender_id: session_id.to_string(),
    }) {
        broadcast_from(state, room_id, session_id, &frame);
    }
}

fn depart(state: &RelayState, room_id: &str, session_id: &str) {
    if state.registry.unregister(room_id, session_id).is_some() {
        info!(room = %room_id, session = %session_id, "session departed");
        announce_leave(state, room_id, session_id);
    }
}

/// Targeted relay of a raw frame. A missing target is an expected race
/// with departure, not an error.
fn forward(state: &RelayState, room_id: &str, target_id: &str, frame: &str) {
    match state.registry.handle_for(room_id, target_id) {
        None => {
            debug!(room = %room_id, target = %target_id, "target not in room; dropping");
        }
        Some(handle) => {
            if handle
                .try_deliver(Outbound::Frame(frame.to_string()))
                .is_err()
            {
                drop_session(state, room_id, target_id);
            }
        }
    }
}

/// Per-member fan-out, never to the sender. No lock is held across the
/// loop; members that cannot keep up are dropped after the fan-out so
/// one stalled connection cannot delay the rest.
fn broadcast_from(state: &RelayState, room_id: &str, sender_id: &str, frame: &str) {
    let mut stalled = Vec::new();
    for member in state.registry.members(room_id) {
        if member == sender_id {
            continue;
        }
        let Some(handle) = state.registry.handle_for(room_id, &member) else {
            continue;
        };
        if handle
            .try_deliver(Outbound::Frame(frame.to_string()))
            .is_err()
        {
            stalled.push(member);
        }
    }
    for member in stalled {
        drop_session(state, room_id, &member);
    }
}

/// Evicts a session whose send queue overflowed (or whose writer is
/// gone) and cleans up as if it had disconnected.
fn drop_session(state: &RelayState, room_id: &str, session_id: &str) {
    if let Some(handle) = state.registry.unregister(room_id, session_id) {
        warn!(
            room = %room_id,
            session = %session_id,
            "dropping session with stalled send queue"
        );
        let _ = handle.try_deliver(Outbound::Close {
            code: close_code::AGAIN,
            reason: "send queue overflow",
        });
        announce_leave(state, room_id, session_id);
    }
}

//! WebSocket connection to the signaling relay.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::warn;
use uuid::Uuid;

use parley_proto::Envelope;

/// Client-generated session id, unique within a room by construction.
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("signaling connection closed")]
    Closed,
}

/// One bidirectional envelope stream to the relay for one room.
pub struct SignalingConnection {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    _task: Option<JoinHandle<()>>,
}

impl SignalingConnection {
    /// Connects to the relay for one room. `server` may be a bare
    /// host:port or a ws:// / wss:// base.
    pub async fn connect(server: &str, room_id: &str) -> Result<Self, SignalingError> {
        let ws_url = build_ws_url(server, room_id);
        let (ws_stream, _) = connect_async(&ws_url).await?;

        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_in, rx_in) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(ws_stream, rx_out, tx_in));

        Ok(Self {
            tx: Some(tx_out),
            rx: rx_in,
            _task: Some(task),
        })
    }

    /// Wires a connection from raw channels, letting tests drive the
    /// coordinator without a server.
    pub fn from_channels(
        tx: mpsc::UnboundedSender<Envelope>,
        rx: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            tx: Some(tx),
            rx,
            _task: None,
        }
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        self.tx
            .as_ref()
            .ok_or(SignalingError::Closed)?
            .send(envelope)
            .map_err(|_| SignalingError::Closed)
    }

    /// Next envelope from the relay; `None` once the connection ends.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Drops the outbound side so the socket task flushes what is
    /// queued, sends a close frame, and exits.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

async fn run_socket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    inbound: mpsc::UnboundedSender<Envelope>,
) {
    let (mut sink, mut stream) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let Ok(text) = serde_json::to_string(&envelope) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => {
                    if inbound.send(envelope).is_err() {
                        break;
                    }
                }
                Err(err) => warn!(%err, "dropping malformed frame from relay"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    send_task.abort();
}

fn build_ws_url(server: &str, room_id: &str) -> String {
    if server.starts_with("ws://") || server.starts_with("wss://") {
        format!("{server}/ws/{room_id}")
    } else if server.contains("localhost") || server.contains("127.0.0.1") {
        format!("ws://{server}/ws/{room_id}")
    } else {
        format!("wss://{server}/ws/{room_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_keeps_explicit_schemes() {
        assert_eq!(
            build_ws_url("wss://relay.example.com", "r1"),
            "wss://relay.example.com/ws/r1"
        );
        assert_eq!(
            build_ws_url("ws://10.0.0.2:8080", "r1"),
            "ws://10.0.0.2:8080/ws/r1"
        );
    }

    #[test]
    fn ws_url_defaults_to_tls_off_loopback() {
        assert_eq!(
            build_ws_url("localhost:8080", "r1"),
            "ws://localhost:8080/ws/r1"
        );
        assert_eq!(
            build_ws_url("relay.example.com", "r1"),
            "wss://relay.example.com/ws/r1"
        );
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(generate_session_id(), generate_session_id());
    }
}

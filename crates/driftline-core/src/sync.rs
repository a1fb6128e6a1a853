//! Relay wire protocol and WebSocket transport.
//!
//! Messages are JSON text frames tagged by `type`. Document deltas travel as
//! base64-encoded Loro update bytes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::presence::PresenceState;

/// Messages sent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room as the given participant
    Join { room: String, participant: String },
    /// Leave the current room
    Leave,
    /// Loro update bytes (base64)
    Update { data: String },
    /// Latest local presence
    Presence { state: PresenceState },
}

/// Messages received from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Room joined; carries the room's merged state if it has any
    Joined {
        room: String,
        peer_count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<String>,
    },
    PeerJoined { participant: String },
    PeerLeft { participant: String },
    /// Update relayed from another participant
    Update { from: String, data: String },
    /// Presence relayed from another participant
    Presence { from: String, state: PresenceState },
    Error { message: String },
}

/// Events surfaced by a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Link established
    Connected,
    /// Link closed or lost
    Disconnected,
    /// The relay acknowledged the join; this is the "synced" signal
    Joined {
        room: String,
        peer_count: usize,
        snapshot: Option<Vec<u8>>,
    },
    PeerJoined { participant: String },
    PeerLeft { participant: String },
    UpdateReceived { from: String, data: Vec<u8> },
    PresenceReceived { from: String, state: PresenceState },
    /// The relay refused a request
    Rejected { message: String },
    /// Transport fault
    Error { message: String },
}

impl SyncEvent {
    /// Decode a relay message into an event.
    pub fn from_server_message(message: ServerMessage) -> Result<Self, base64::DecodeError> {
        Ok(match message {
            ServerMessage::Joined {
                room,
                peer_count,
                snapshot,
            } => SyncEvent::Joined {
                room,
                peer_count,
                snapshot: snapshot.as_deref().map(decode_payload).transpose()?,
            },
            ServerMessage::PeerJoined { participant } => SyncEvent::PeerJoined { participant },
            ServerMessage::PeerLeft { participant } => SyncEvent::PeerLeft { participant },
            ServerMessage::Update { from, data } => SyncEvent::UpdateReceived {
                from,
                data: decode_payload(&data)?,
            },
            ServerMessage::Presence { from, state } => SyncEvent::PresenceReceived { from, state },
            ServerMessage::Error { message } => SyncEvent::Rejected { message },
        })
    }

    /// Parse a text frame from the relay.
    pub fn parse(text: &str) -> crate::error::SessionResult<Self> {
        let message: ServerMessage = serde_json::from_str(text)?;
        Ok(Self::from_server_message(message)?)
    }
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}

/// A message channel to the relay.
///
/// Implementations never block: events are buffered and handed out by
/// [`poll_events`](Transport::poll_events).
pub trait Transport {
    /// Start connecting. Completion is reported as [`SyncEvent::Connected`].
    fn connect(&mut self, url: &str) -> Result<(), TransportError>;

    /// Queue a message for the relay.
    fn send(&self, message: &ClientMessage) -> Result<(), TransportError>;

    /// Take pending events.
    fn poll_events(&mut self) -> Vec<SyncEvent>;

    /// Close the link. Safe to call when not connected.
    fn disconnect(&mut self);
}

#[cfg(not(target_arch = "wasm32"))]
mod native_client {
    use super::*;
    use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tungstenite::{Message, connect};
    use url::Url;

    /// Commands sent to the WebSocket thread.
    enum WsCommand {
        Send(String),
        Close,
    }

    /// WebSocket client for native platforms.
    ///
    /// Uses a background thread for non-blocking operation.
    pub struct NativeWebSocket {
        /// Channel to send commands to the WebSocket thread.
        cmd_tx: Option<Sender<WsCommand>>,
        /// Channel to receive events from the WebSocket thread.
        event_rx: Option<Receiver<SyncEvent>>,
        _thread: Option<JoinHandle<()>>,
    }

    impl NativeWebSocket {
        pub fn new() -> Self {
            Self {
                cmd_tx: None,
                event_rx: None,
                _thread: None,
            }
        }

        pub fn is_open(&self) -> bool {
            self.cmd_tx.is_some()
        }
    }

    fn validate_url(url: &str) -> Result<Url, TransportError> {
        let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(parsed),
            other => Err(TransportError::InvalidScheme(other.to_string())),
        }
    }

    fn run_socket(url: String, cmd_rx: Receiver<WsCommand>, event_tx: Sender<SyncEvent>) {
        log::info!("WebSocket thread: connecting to {}", url);

        let (mut socket, response) = match connect(url.as_str()) {
            Ok(connected) => connected,
            Err(e) => {
                log::error!("WebSocket connection failed: {}", e);
                let _ = event_tx.send(SyncEvent::Error {
                    message: format!("Connection failed: {}", e),
                });
                return;
            }
        };

        log::info!("WebSocket connected, status: {}", response.status());
        let _ = event_tx.send(SyncEvent::Connected);

        // Short read timeout so outgoing commands are serviced between reads
        if let tungstenite::stream::MaybeTlsStream::Plain(tcp) = socket.get_mut() {
            let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
            let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
        }

        loop {
            match cmd_rx.try_recv() {
                Ok(WsCommand::Send(text)) => {
                    log::debug!("WebSocket sending: {}", &text[..text.len().min(100)]);
                    if let Err(e) = socket.send(Message::Text(text)) {
                        log::error!("WebSocket send error: {}", e);
                        break;
                    }
                }
                Ok(WsCommand::Close) => {
                    log::info!("WebSocket close requested");
                    let _ = socket.close(None);
                    let _ = socket.flush();
                    return;
                }
                Err(TryRecvError::Disconnected) => {
                    log::info!("WebSocket command channel disconnected");
                    return;
                }
                Err(TryRecvError::Empty) => {}
            }

            match socket.read() {
                Ok(Message::Text(text)) => match SyncEvent::parse(&text) {
                    Ok(event) => {
                        let _ = event_tx.send(event);
                    }
                    Err(e) => log::warn!("Dropping malformed relay frame: {}", e),
                },
                Ok(Message::Ping(data)) => {
                    let _ = socket.send(Message::Pong(data));
                }
                Ok(Message::Close(_)) => {
                    log::info!("WebSocket received close frame");
                    break;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    log::error!("WebSocket read error: {}", e);
                    break;
                }
            }
        }

        log::info!("WebSocket thread exiting");
        let _ = event_tx.send(SyncEvent::Disconnected);
    }

    impl Transport for NativeWebSocket {
        fn connect(&mut self, url: &str) -> Result<(), TransportError> {
            if self.cmd_tx.is_some() {
                return Err(TransportError::AlreadyConnected);
            }
            let url = validate_url(url)?;

            let (cmd_tx, cmd_rx) = channel::<WsCommand>();
            let (event_tx, event_rx) = channel::<SyncEvent>();
            let handle = thread::spawn(move || run_socket(url.to_string(), cmd_rx, event_tx));

            self.cmd_tx = Some(cmd_tx);
            self.event_rx = Some(event_rx);
            self._thread = Some(handle);
            Ok(())
        }

        fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
            let tx = self.cmd_tx.as_ref().ok_or(TransportError::NotConnected)?;
            let text = serde_json::to_string(message)?;
            tx.send(WsCommand::Send(text))
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        }

        fn poll_events(&mut self) -> Vec<SyncEvent> {
            let Some(rx) = self.event_rx.as_ref() else {
                return Vec::new();
            };

            let mut events = Vec::new();
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
            // The thread is gone; drop the link so the next connect starts fresh
            if matches!(
                events.last(),
                Some(SyncEvent::Disconnected | SyncEvent::Error { .. })
            ) {
                self.cmd_tx = None;
                self.event_rx = None;
                self._thread = None;
            }
            events
        }

        fn disconnect(&mut self) {
            if let Some(tx) = self.cmd_tx.take() {
                let _ = tx.send(WsCommand::Close);
            }
            self.event_rx = None;
            self._thread = None;
        }
    }

    impl Default for NativeWebSocket {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for NativeWebSocket {
        fn drop(&mut self) {
            self.disconnect();
        }
    }

}

#[cfg(not(target_arch = "wasm32"))]
pub use native_client::NativeWebSocket;

/// Platform-specific WebSocket client type.
#[cfg(not(target_arch = "wasm32"))]
pub type PlatformWebSocket = NativeWebSocket;

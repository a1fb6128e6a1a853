//! Driftline WebSocket Relay Server
//!
//! Relays line updates and presence between the participants of a room and
//! keeps a merged replica per room so late joiners start from full state.
//!
//! ## Protocol
//!
//! Messages are JSON with the following format:
//! ```json
//! { "type": "join", "room": "room-id", "participant": "uuid" }
//! { "type": "update", "data": "<base64-encoded-loro-bytes>" }
//! { "type": "presence", "state": { "id": "uuid", "point": { "x": 1, "y": 2 }, ... } }
//! { "type": "leave" }
//! ```

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use dashmap::DashMap;
use driftline_core::sync::{ClientMessage, ServerMessage, decode_payload, encode_payload};
use futures_util::{SinkExt, StreamExt};
use loro::{ExportMode, LoroDoc, VersionVector};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_PORT: u16 = 3030;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;
/// Sender name on frames that originate from the relay itself.
const RELAY_PARTICIPANT: &str = "relay";

/// Server configuration, read from `DRIFTLINE_*` environment variables.
#[derive(Debug, Clone)]
struct RelayConfig {
    addr: SocketAddr,
    channel_capacity: usize,
}

impl RelayConfig {
    fn from_env() -> Self {
        let addr = std::env::var("DRIFTLINE_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)));
        let channel_capacity = std::env::var("DRIFTLINE_CHANNEL_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        Self {
            addr,
            channel_capacity,
        }
    }
}

type RoomFrame = (String, ServerMessage);

/// Room state
struct Room {
    /// Broadcast channel for this room
    tx: broadcast::Sender<RoomFrame>,
    /// Participant id -> id of the connection currently speaking for it
    peers: HashMap<String, Uuid>,
    /// Merged state of every update seen in this room
    doc: LoroDoc,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            peers: HashMap::new(),
            doc: LoroDoc::new(),
        }
    }

    fn snapshot(&self) -> Option<String> {
        if self.doc.oplog_vv() == VersionVector::default() {
            return None;
        }
        match self.doc.export(ExportMode::Snapshot) {
            Ok(bytes) => Some(encode_payload(&bytes)),
            Err(e) => {
                warn!("Snapshot export failed: {}", e);
                None
            }
        }
    }
}

/// Shared application state
struct AppState {
    /// Active rooms
    rooms: DashMap<String, Room>,
    channel_capacity: usize,
}

struct Joined {
    rx: broadcast::Receiver<RoomFrame>,
    snapshot: Option<String>,
    peer_count: usize,
}

impl AppState {
    fn new(channel_capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            channel_capacity,
        }
    }

    /// Add a participant to a room, creating the room if needed
    fn join_room(&self, room_id: &str, participant: &str, connection: Uuid) -> Joined {
        let mut room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(self.channel_capacity));
        room.peers.insert(participant.to_string(), connection);
        Joined {
            rx: room.tx.subscribe(),
            snapshot: room.snapshot(),
            peer_count: room.peers.len(),
        }
    }

    /// Remove a participant if this connection still speaks for it.
    /// Returns whether it was removed.
    fn leave_room(&self, room_id: &str, participant: &str, connection: Uuid) -> bool {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        if room.peers.get(participant) != Some(&connection) {
            return false;
        }
        room.peers.remove(participant);
        // Clean up empty rooms
        if room.peers.is_empty() {
            drop(room);
            self.rooms.remove(room_id);
            info!("Room {} closed", room_id);
        }
        true
    }

    /// Merge an update into the room replica
    fn apply_update(&self, room_id: &str, data: &str) -> Result<(), String> {
        let bytes = decode_payload(data).map_err(|e| format!("Invalid payload: {}", e))?;
        let room = self
            .rooms
            .get(room_id)
            .ok_or_else(|| format!("Unknown room {}", room_id))?;
        room.doc
            .import(&bytes)
            .map_err(|e| format!("Rejected update: {}", e))?;
        Ok(())
    }

    /// Broadcast message to room
    fn broadcast(&self, room_id: &str, from: &str, msg: ServerMessage) {
        if let Some(room) = self.rooms.get(room_id) {
            let _ = room.tx.send((from.to_string(), msg));
        }
    }

    /// Full room state as one update, for a receiver that fell behind.
    fn resync(&self, room_id: &str) -> Option<ServerMessage> {
        let room = self.rooms.get(room_id)?;
        room.snapshot().map(|data| ServerMessage::Update {
            from: RELAY_PARTICIPANT.to_string(),
            data,
        })
    }

    fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "driftline_server=info,tower_http=info".into()),
        )
        .init();

    let config = RelayConfig::from_env();
    let state = Arc::new(AppState::new(config.channel_capacity));

    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("Driftline relay server listening on {}", config.addr);
    info!("WebSocket endpoint: ws://{}/ws", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await
}

/// Index page
async fn index() -> &'static str {
    "Driftline Relay Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn frame(msg: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("Failed to encode {:?}: {}", msg, e);
            None
        }
    }
}

/// Membership of one connection: which room, and as which participant.
struct Membership {
    room: String,
    participant: String,
}

fn depart(state: &AppState, member: &Membership, connection: Uuid) {
    if state.leave_room(&member.room, &member.participant, connection) {
        state.broadcast(
            &member.room,
            &member.participant,
            ServerMessage::PeerLeft {
                participant: member.participant.clone(),
            },
        );
        info!("Participant {} left room {}", member.participant, member.room);
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection = Uuid::new_v4();
    info!("New connection: {}", connection);

    let (mut sender, mut receiver) = socket.split();
    let mut member: Option<Membership> = None;
    let mut room_rx: Option<broadcast::Receiver<RoomFrame>> = None;

    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", connection, e);
                        break;
                    }
                };

                let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => client_msg,
                    Err(e) => {
                        warn!("Invalid message from {}: {}", connection, e);
                        let err = ServerMessage::Error {
                            message: format!("Invalid message: {}", e),
                        };
                        if let Some(reply) = frame(&err) {
                            let _ = sender.send(reply).await;
                        }
                        continue;
                    }
                };

                match client_msg {
                    ClientMessage::Join { room, participant } => {
                        if let Some(old) = member.take() {
                            depart(&state, &old, connection);
                        }

                        let joined = state.join_room(&room, &participant, connection);
                        room_rx = Some(joined.rx);
                        let reply = ServerMessage::Joined {
                            room: room.clone(),
                            peer_count: joined.peer_count,
                            snapshot: joined.snapshot,
                        };
                        let Some(reply) = frame(&reply) else { break };
                        if sender.send(reply).await.is_err() {
                            break;
                        }

                        // Notify others
                        state.broadcast(&room, &participant, ServerMessage::PeerJoined {
                            participant: participant.clone(),
                        });
                        info!("Participant {} joined room {} ({} peers)", participant, room, joined.peer_count);
                        member = Some(Membership { room, participant });
                    }
                    ClientMessage::Leave => {
                        if let Some(old) = member.take() {
                            depart(&state, &old, connection);
                        }
                        room_rx = None;
                    }
                    ClientMessage::Update { data } => {
                        let Some(m) = &member else {
                            if let Some(reply) = frame(&ServerMessage::Error {
                                message: "Not in a room".to_string(),
                            }) {
                                let _ = sender.send(reply).await;
                            }
                            continue;
                        };
                        match state.apply_update(&m.room, &data) {
                            Ok(()) => state.broadcast(&m.room, &m.participant, ServerMessage::Update {
                                from: m.participant.clone(),
                                data,
                            }),
                            Err(message) => {
                                warn!("Update from {} dropped: {}", m.participant, message);
                                if let Some(reply) = frame(&ServerMessage::Error { message }) {
                                    let _ = sender.send(reply).await;
                                }
                            }
                        }
                    }
                    ClientMessage::Presence { state: mut presence } => {
                        if let Some(m) = &member {
                            presence.id = m.participant.clone();
                            state.broadcast(&m.room, &m.participant, ServerMessage::Presence {
                                from: m.participant.clone(),
                                state: presence,
                            });
                        }
                    }
                }
            }

            // Handle broadcast messages from room
            msg = async {
                match &mut room_rx {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match msg {
                    Ok((from, server_msg)) => {
                        // Don't echo back to sender
                        let own = member.as_ref().is_some_and(|m| m.participant == from);
                        if own {
                            continue;
                        }
                        let Some(out) = frame(&server_msg) else { continue };
                        if sender.send(out).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Connection {} lagged, {} frames skipped", connection, skipped);
                        // Skipped deltas are never resent; ship the merged state instead
                        let Some(m) = &member else { continue };
                        let Some(out) = state.resync(&m.room).as_ref().and_then(frame) else {
                            continue;
                        };
                        if sender.send(out).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => room_rx = None,
                }
            }
        }
    }

    // Cleanup on disconnect
    if let Some(old) = member.take() {
        depart(&state, &old, connection);
    }
    info!("Connection closed: {}", connection);
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftline_core::{Color, Line, LineDocument, Point};

    fn update_with_line(id: &str) -> String {
        let mut doc = LineDocument::new();
        doc.create_line(&Line::new(id.to_string(), Point::ZERO, Color::black()))
            .unwrap();
        encode_payload(&doc.export_all_updates())
    }

    #[test]
    fn test_first_joiner_gets_no_snapshot() {
        let state = AppState::new(16);
        let joined = state.join_room("r", "alice", Uuid::new_v4());
        assert!(joined.snapshot.is_none());
        assert_eq!(joined.peer_count, 1);
    }

    #[test]
    fn test_late_joiner_gets_merged_state() {
        let state = AppState::new(16);
        state.join_room("r", "alice", Uuid::new_v4());
        state.apply_update("r", &update_with_line("1")).unwrap();
        state.apply_update("r", &update_with_line("2")).unwrap();

        let joined = state.join_room("r", "bob", Uuid::new_v4());
        assert_eq!(joined.peer_count, 2);
        let bytes = decode_payload(&joined.snapshot.unwrap()).unwrap();
        let doc = LineDocument::from_snapshot(&bytes).unwrap();
        assert_eq!(doc.line_count(), 2);
    }

    #[test]
    fn test_bad_update_rejected() {
        let state = AppState::new(16);
        state.join_room("r", "alice", Uuid::new_v4());
        assert!(state.apply_update("r", "***").is_err());
        assert!(state.apply_update("r", &encode_payload(b"garbage")).is_err());
        assert!(state.apply_update("missing", &update_with_line("1")).is_err());
    }

    #[test]
    fn test_empty_room_is_dropped() {
        let state = AppState::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        state.join_room("r", "alice", alice);
        state.join_room("r", "bob", bob);

        assert!(state.leave_room("r", "alice", alice));
        assert_eq!(state.room_count(), 1);
        assert!(state.leave_room("r", "bob", bob));
        assert_eq!(state.room_count(), 0);
        assert!(!state.leave_room("r", "bob", bob));
    }

    #[test]
    fn test_stale_connection_does_not_evict_rejoin() {
        let state = AppState::new(16);
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        state.join_room("r", "alice", old);
        state.join_room("r", "alice", new);

        assert!(!state.leave_room("r", "alice", old));
        assert_eq!(state.room_count(), 1);
        assert!(state.leave_room("r", "alice", new));
    }

    #[test]
    fn test_broadcast_reaches_subscribers() {
        let state = AppState::new(16);
        let mut joined = state.join_room("r", "alice", Uuid::new_v4());
        state.broadcast("r", "bob", ServerMessage::PeerJoined {
            participant: "bob".to_string(),
        });

        let (from, msg) = joined.rx.try_recv().unwrap();
        assert_eq!(from, "bob");
        assert_eq!(
            msg,
            ServerMessage::PeerJoined {
                participant: "bob".to_string()
            }
        );
    }

    #[test]
    fn test_lagging_receiver_gets_full_state() {
        let state = AppState::new(1);
        let mut joined = state.join_room("r", "alice", Uuid::new_v4());
        state.join_room("r", "bob", Uuid::new_v4());
        for id in ["1", "2"] {
            let data = update_with_line(id);
            state.apply_update("r", &data).unwrap();
            state.broadcast("r", "bob", ServerMessage::Update {
                from: "bob".to_string(),
                data,
            });
        }

        assert!(matches!(
            joined.rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));

        let Some(ServerMessage::Update { from, data }) = state.resync("r") else {
            panic!("expected a full-state update");
        };
        assert_eq!(from, RELAY_PARTICIPANT);
        let mut doc = LineDocument::new();
        doc.import(&decode_payload(&data).unwrap()).unwrap();
        assert_eq!(doc.line_count(), 2);
        assert!(state.resync("missing").is_none());
    }

    #[test]
    fn test_config_defaults() {
        let config = RelayConfig::from_env();
        assert!(config.channel_capacity > 0);
    }
}

//! Connection lifecycle with the relay.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──joined──▶ Synced
//!                       ▲                    │
//!                       └──── link lost ─────┘
//! any ──disconnect──▶ Disconnected (terminal)
//! ```
//!
//! The session is driven by [`SyncSession::poll`] from the host's event
//! loop. Local edits never wait for the network: they land in the replica
//! right away and are pushed to the relay on the next poll while synced.

use std::time::{Duration, Instant};

use loro::VersionVector;

use crate::context::SessionContext;
use crate::error::{SessionError, SessionResult};
use crate::presence::PresenceTracker;
use crate::sync::{ClientMessage, SyncEvent, Transport, encode_payload};

/// Canvas opacity while the shared state is not yet trustworthy.
pub const UNSYNCED_OPACITY: f64 = 0.2;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet
    Idle,
    /// Waiting for the relay to acknowledge the join
    Connecting,
    /// Joined and exchanging updates
    Synced,
    /// Torn down for good
    Disconnected,
}

/// Keeps one participant's replica in sync with a relay room.
pub struct SyncSession<T: Transport> {
    context: SessionContext,
    presence: PresenceTracker,
    transport: T,
    state: ConnectionState,
    /// Version last pushed to the relay; `None` until the first push after a join.
    sent_version: Option<VersionVector>,
    retry_at: Option<Instant>,
    backoff: Duration,
    peer_count: usize,
}

#[cfg(not(target_arch = "wasm32"))]
impl SyncSession<crate::sync::NativeWebSocket> {
    /// Session over the native WebSocket client.
    pub fn new(context: &SessionContext) -> Self {
        Self::with_transport(context, crate::sync::NativeWebSocket::new())
    }
}

impl<T: Transport> SyncSession<T> {
    pub fn with_transport(context: &SessionContext, transport: T) -> Self {
        Self {
            context: context.clone(),
            presence: PresenceTracker::new(context),
            transport,
            state: ConnectionState::Idle,
            sent_version: None,
            retry_at: None,
            backoff: context.config().reconnect_initial(),
            peer_count: 0,
        }
    }

    /// Open the link to the configured relay and room.
    pub fn connect(&mut self) -> SessionResult<()> {
        match self.state {
            ConnectionState::Disconnected => return Err(SessionError::Closed),
            ConnectionState::Connecting | ConnectionState::Synced => return Ok(()),
            ConnectionState::Idle => {}
        }

        self.open_link().inspect_err(|e| log::error!("Connect failed: {}", e))?;
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    fn open_link(&mut self) -> SessionResult<()> {
        let url = self.context.config().server_url.clone();
        log::info!("Connecting to {} (room {})", url, self.context.config().room);
        self.transport.connect(&url)?;
        Ok(())
    }

    /// Run one dispatch step using the current time.
    pub fn poll(&mut self) -> Vec<SyncEvent> {
        self.poll_at(Instant::now())
    }

    /// Run one dispatch step: push local changes, apply relay events,
    /// retry the link when due and notify line observers.
    ///
    /// Returns the events that were applied.
    pub fn poll_at(&mut self, now: Instant) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Synced
        ) {
            self.flush();
            events = self.transport.poll_events();
            for event in &events {
                self.handle_event(event, now);
            }
            self.flush();
        }

        if self.retry_at.is_some_and(|at| now >= at) {
            self.retry_at = None;
            self.transport.disconnect();
            if let Err(e) = self.open_link() {
                log::warn!("Reconnect failed: {}", e);
                self.handle_link_lost(now);
            }
        }

        self.context.publish_lines();
        events
    }

    fn handle_event(&mut self, event: &SyncEvent, now: Instant) {
        match event {
            SyncEvent::Connected => {
                log::info!("Connected, joining room {}", self.context.config().room);
                self.send(&ClientMessage::Join {
                    room: self.context.config().room.clone(),
                    participant: self.presence.local_id(),
                });
            }
            SyncEvent::Joined {
                room,
                peer_count,
                snapshot,
            } => {
                if let Some(bytes) = snapshot {
                    if let Err(e) = self.context.document_mut().import(bytes) {
                        log::warn!("Failed to import room snapshot: {}", e);
                    }
                }
                log::info!("Synced with room {} ({} peers)", room, peer_count);
                self.state = ConnectionState::Synced;
                self.peer_count = *peer_count;
                self.backoff = self.context.config().reconnect_initial();
                // The relay may have missed anything made offline
                self.sent_version = None;
                self.presence.announce();
                self.context.publish_lines();
            }
            SyncEvent::PeerJoined { participant } => {
                log::info!("Peer joined: {}", participant);
                self.peer_count += 1;
            }
            SyncEvent::PeerLeft { participant } => {
                log::info!("Peer left: {}", participant);
                self.peer_count = self.peer_count.saturating_sub(1);
                self.presence.remove(participant);
            }
            SyncEvent::UpdateReceived { from, data } => {
                log::debug!("Update from {} ({} bytes)", from, data.len());
                self.import_remote(data);
            }
            SyncEvent::PresenceReceived { from, state } => {
                let mut state = state.clone();
                state.id = from.clone();
                self.presence.apply_remote(state);
            }
            SyncEvent::Rejected { message } => {
                log::warn!("Relay rejected request: {}", message);
            }
            SyncEvent::Error { message } => {
                log::warn!("Transport error: {}", message);
                self.handle_link_lost(now);
            }
            SyncEvent::Disconnected => self.handle_link_lost(now),
        }
    }

    fn handle_link_lost(&mut self, now: Instant) {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Disconnected
        ) {
            return;
        }

        self.state = ConnectionState::Connecting;
        self.peer_count = 0;
        self.presence.clear_remote();

        if self.retry_at.is_none() {
            log::info!("Link lost, retrying in {:?}", self.backoff);
            self.retry_at = Some(now + self.backoff);
            self.backoff = (self.backoff * 2).min(self.context.config().reconnect_max());
        }
    }

    fn import_remote(&mut self, data: &[u8]) {
        let caught_up = self.sent_version.as_ref() == Some(&self.context.document().version());
        if let Err(e) = self.context.document_mut().import(data) {
            log::warn!("Failed to import update: {}", e);
            return;
        }
        // Don't echo what we just received
        if caught_up {
            self.sent_version = Some(self.context.document().version());
        }
    }

    /// Push local document changes and queued presence to the relay.
    fn flush(&mut self) {
        if self.state != ConnectionState::Synced {
            return;
        }

        let version = self.context.document().version();
        if self.sent_version.as_ref() != Some(&version) {
            let since = self.sent_version.take().unwrap_or_default();
            if since != version {
                let bytes = self.context.document().export_updates(&since);
                self.send(&ClientMessage::Update {
                    data: encode_payload(&bytes),
                });
            }
            self.sent_version = Some(version);
        }

        for message in self.context.take_outgoing() {
            self.send(&message);
        }
    }

    fn send(&self, message: &ClientMessage) {
        if let Err(e) = self.transport.send(message) {
            log::warn!("Failed to send to relay: {}", e);
        }
    }

    /// Leave the room and close the link. Further calls do nothing.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        if self.state == ConnectionState::Synced {
            self.flush();
            self.send(&ClientMessage::Leave);
        }
        self.transport.disconnect();
        self.state = ConnectionState::Disconnected;
        self.retry_at = None;
        self.peer_count = 0;
        self.presence.clear_remote();
        log::info!("Session disconnected");
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == ConnectionState::Synced
    }

    /// Opacity the canvas should be drawn with.
    pub fn canvas_opacity(&self) -> f64 {
        if self.is_synced() { 1.0 } else { UNSYNCED_OPACITY }
    }

    /// Participants in the room, this one included, as last reported by the relay.
    pub fn peer_count(&self) -> usize {
        self.peer_count
    }

    /// When the next reconnect attempt is due, if one is scheduled.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport> Drop for SyncSession<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::crdt::LineDocument;
    use crate::error::TransportError;
    use crate::line::{Color, Line};
    use crate::presence::PresenceState;
    use crate::store::LineStore;
    use crate::sync::decode_payload;
    use kurbo::Point;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Wire {
        connects: Vec<String>,
        sent: Vec<ClientMessage>,
        inbox: Vec<SyncEvent>,
        refuse_connect: bool,
        closes: usize,
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        wire: Rc<RefCell<Wire>>,
    }

    impl MockTransport {
        fn push(&self, event: SyncEvent) {
            self.wire.borrow_mut().inbox.push(event);
        }

        fn take_sent(&self) -> Vec<ClientMessage> {
            std::mem::take(&mut self.wire.borrow_mut().sent)
        }
    }

    impl Transport for MockTransport {
        fn connect(&mut self, url: &str) -> Result<(), TransportError> {
            let mut wire = self.wire.borrow_mut();
            if wire.refuse_connect {
                return Err(TransportError::InvalidScheme("http".to_string()));
            }
            wire.connects.push(url.to_string());
            Ok(())
        }

        fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
            self.wire.borrow_mut().sent.push(message.clone());
            Ok(())
        }

        fn poll_events(&mut self) -> Vec<SyncEvent> {
            std::mem::take(&mut self.wire.borrow_mut().inbox)
        }

        fn disconnect(&mut self) {
            self.wire.borrow_mut().closes += 1;
        }
    }

    fn session() -> (SessionContext, MockTransport, SyncSession<MockTransport>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = SessionContext::new(SessionConfig::default().with_room("test-room"));
        let mock = MockTransport::default();
        let session = SyncSession::with_transport(&ctx, mock.clone());
        (ctx, mock, session)
    }

    fn joined(snapshot: Option<Vec<u8>>) -> SyncEvent {
        SyncEvent::Joined {
            room: "test-room".to_string(),
            peer_count: 1,
            snapshot,
        }
    }

    fn synced() -> (SessionContext, MockTransport, SyncSession<MockTransport>) {
        let (ctx, mock, mut session) = session();
        session.connect().unwrap();
        mock.push(SyncEvent::Connected);
        mock.push(joined(None));
        session.poll();
        mock.take_sent();
        (ctx, mock, session)
    }

    fn pushed_updates(sent: &[ClientMessage]) -> Vec<Vec<u8>> {
        sent.iter()
            .filter_map(|m| match m {
                ClientMessage::Update { data } => decode_payload(data).ok(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_then_sync() {
        let (ctx, mock, mut session) = session();
        assert_eq!(session.state(), ConnectionState::Idle);

        session.connect().unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.canvas_opacity(), UNSYNCED_OPACITY);

        mock.push(SyncEvent::Connected);
        session.poll();
        let participant = PresenceTracker::new(&ctx).local_id();
        assert_eq!(
            mock.take_sent(),
            vec![ClientMessage::Join {
                room: "test-room".to_string(),
                participant,
            }]
        );

        let mut peer = LineDocument::new();
        peer.create_line(&Line::new("42".into(), Point::ZERO, Color::black()))
            .unwrap();
        mock.push(joined(Some(peer.export_snapshot())));
        session.poll();

        assert!(session.is_synced());
        assert_eq!(session.canvas_opacity(), 1.0);
        assert_eq!(session.peer_count(), 1);
        assert_eq!(ctx.lines().len(), 1);
        let sent = mock.take_sent();
        assert!(sent.iter().any(|m| matches!(m, ClientMessage::Presence { .. })));
    }

    #[test]
    fn test_offline_edits_pushed_once_synced() {
        let (ctx, mock, mut session) = session();
        let mut store = LineStore::new(&ctx);
        session.connect().unwrap();

        store.start_line_at(Point::new(1.0, 1.0), 1_000).unwrap();
        store.add_point(Point::new(2.0, 2.0));
        store.complete_line();
        session.poll();
        assert!(pushed_updates(&mock.take_sent()).is_empty());

        mock.push(SyncEvent::Connected);
        mock.push(joined(None));
        session.poll();

        let updates = pushed_updates(&mock.take_sent());
        assert_eq!(updates.len(), 1);
        let mut relay = LineDocument::new();
        relay.import(&updates[0]).unwrap();
        assert_eq!(relay.lines(), store.lines());
    }

    #[test]
    fn test_local_edits_are_pushed_incrementally() {
        let (ctx, mock, mut session) = synced();
        let mut store = LineStore::new(&ctx);
        let mut relay = LineDocument::new();

        store.start_line_at(Point::ZERO, 1_000).unwrap();
        session.poll();
        store.add_point(Point::new(1.0, 0.0));
        session.poll();
        store.complete_line();
        session.poll();

        let updates = pushed_updates(&mock.take_sent());
        assert_eq!(updates.len(), 3);
        for update in &updates {
            relay.import(update).unwrap();
        }
        assert_eq!(relay.lines(), store.lines());

        session.poll();
        assert!(mock.take_sent().is_empty());
    }

    #[test]
    fn test_remote_update_applied_without_echo() {
        let (ctx, mock, mut session) = synced();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = seen.clone();
        let _sub = ctx.subscribe_lines(move |lines| seen_in.borrow_mut().push(lines.len()));

        let mut peer = LineDocument::new();
        peer.create_line(&Line::new("7".into(), Point::ZERO, Color::black()))
            .unwrap();
        mock.push(SyncEvent::UpdateReceived {
            from: "peer".to_string(),
            data: peer.export_all_updates(),
        });
        session.poll();

        assert_eq!(*seen.borrow(), vec![0, 1]);
        assert!(pushed_updates(&mock.take_sent()).is_empty());
    }

    #[test]
    fn test_peer_departure_clears_only_its_presence() {
        let (ctx, mock, mut session) = synced();
        let presence = PresenceTracker::new(&ctx);
        let mut store = LineStore::new(&ctx);
        store.start_line_at(Point::ZERO, 1_000).unwrap();

        for id in ["peer-a", "peer-b"] {
            mock.push(SyncEvent::PeerJoined {
                participant: id.to_string(),
            });
            mock.push(SyncEvent::PresenceReceived {
                from: id.to_string(),
                state: PresenceState::new(id),
            });
        }
        session.poll();
        assert_eq!(presence.participants().len(), 3);
        assert_eq!(session.peer_count(), 3);

        let lines_before = ctx.lines();
        mock.push(SyncEvent::PeerLeft {
            participant: "peer-a".to_string(),
        });
        session.poll();

        let all = presence.participants();
        assert_eq!(all.len(), 2);
        assert!(!all.contains_key("peer-a"));
        assert!(all.contains_key("peer-b"));
        assert_eq!(ctx.lines(), lines_before);
    }

    #[test]
    fn test_reconnect_with_backoff() {
        let (ctx, mock, mut session) = synced();
        let presence = PresenceTracker::new(&ctx);
        mock.push(SyncEvent::PresenceReceived {
            from: "peer-a".to_string(),
            state: PresenceState::new("peer-a"),
        });
        session.poll();
        assert_eq!(presence.others().len(), 1);

        let t0 = Instant::now();
        mock.push(SyncEvent::Disconnected);
        session.poll_at(t0);
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.canvas_opacity(), UNSYNCED_OPACITY);
        assert!(presence.others().is_empty());
        assert_eq!(mock.wire.borrow().connects.len(), 1);

        session.poll_at(t0 + Duration::from_millis(400));
        assert_eq!(mock.wire.borrow().connects.len(), 1);

        session.poll_at(t0 + Duration::from_millis(500));
        assert_eq!(mock.wire.borrow().connects.len(), 2);

        // Second failure waits twice as long
        let t1 = t0 + Duration::from_millis(600);
        mock.push(SyncEvent::Error {
            message: "refused".to_string(),
        });
        session.poll_at(t1);
        assert_eq!(session.retry_at(), Some(t1 + Duration::from_millis(1000)));

        session.poll_at(t1 + Duration::from_millis(1000));
        mock.push(SyncEvent::Connected);
        mock.push(joined(None));
        session.poll_at(t1 + Duration::from_millis(1100));
        assert!(session.is_synced());

        let t2 = t1 + Duration::from_secs(5);
        mock.push(SyncEvent::Disconnected);
        session.poll_at(t2);
        assert_eq!(session.retry_at(), Some(t2 + Duration::from_millis(500)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let (_ctx, mock, mut session) = synced();
        let mut now = Instant::now();
        let mut delays = Vec::new();
        for _ in 0..8 {
            mock.push(SyncEvent::Disconnected);
            session.poll_at(now);
            let at = session.retry_at().unwrap();
            delays.push(at - now);
            now = at;
            session.poll_at(now);
        }
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_millis(1000));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (_ctx, mock, mut session) = synced();
        session.disconnect();
        session.disconnect();

        assert_eq!(session.state(), ConnectionState::Disconnected);
        let leaves = mock
            .take_sent()
            .into_iter()
            .filter(|m| *m == ClientMessage::Leave)
            .count();
        assert_eq!(leaves, 1);
        assert_eq!(mock.wire.borrow().closes, 1);
        assert!(matches!(session.connect(), Err(SessionError::Closed)));
    }

    #[test]
    fn test_drop_disconnects() {
        let (_ctx, mock, session) = synced();
        drop(session);
        assert!(mock.take_sent().contains(&ClientMessage::Leave));
        assert_eq!(mock.wire.borrow().closes, 1);
    }

    #[test]
    fn test_failed_connect_stays_idle() {
        let (_ctx, mock, mut session) = session();
        mock.wire.borrow_mut().refuse_connect = true;
        assert!(session.connect().is_err());
        assert_eq!(session.state(), ConnectionState::Idle);

        mock.wire.borrow_mut().refuse_connect = false;
        assert!(session.connect().is_ok());
        assert_eq!(session.state(), ConnectionState::Connecting);
    }
}

//! Shared session state.
//!
//! A [`SessionContext`] is built once per process and handed by reference to
//! every component constructor. It owns the replicated document, the presence
//! book, the change feeds and the outbound message queue; components keep a
//! cheap clone of the handle.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use loro::VersionVector;

use crate::config::SessionConfig;
use crate::coords::CoordinateMapper;
use crate::crdt::LineDocument;
use crate::line::Line;
use crate::observe::{Observers, Subscription};
use crate::presence::{Participants, PresenceBook};
use crate::sync::ClientMessage;

struct ContextInner {
    config: SessionConfig,
    mapper: CoordinateMapper,
    document: RefCell<LineDocument>,
    presence: RefCell<PresenceBook>,
    outbox: RefCell<Vec<ClientMessage>>,
    line_observers: Observers<[Line]>,
    presence_observers: Observers<Participants>,
    /// Version of the last snapshot delivered to line observers.
    published: RefCell<Option<VersionVector>>,
}

/// Handle to the per-process session state.
#[derive(Clone)]
pub struct SessionContext {
    inner: Rc<ContextInner>,
}

impl SessionContext {
    /// Create the session state for a new participant.
    pub fn new(config: SessionConfig) -> Self {
        let document = LineDocument::with_max_undo_steps(config.max_undo_steps);
        let mapper = CoordinateMapper::from_config(&config);
        let presence = PresenceBook::new_local();
        log::info!("Session created for participant {}", presence.local.id);

        Self {
            inner: Rc::new(ContextInner {
                config,
                mapper,
                document: RefCell::new(document),
                presence: RefCell::new(presence),
                outbox: RefCell::new(Vec::new()),
                line_observers: Observers::new(),
                presence_observers: Observers::new(),
                published: RefCell::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Input mapper, with its epoch fixed when the session was created.
    pub fn mapper(&self) -> CoordinateMapper {
        self.inner.mapper
    }

    /// Borrow the replicated document.
    pub fn document(&self) -> Ref<'_, LineDocument> {
        self.inner.document.borrow()
    }

    /// Mutably borrow the replicated document.
    ///
    /// Call [`publish_lines`](Self::publish_lines) after mutating so
    /// observers see the change.
    pub fn document_mut(&self) -> RefMut<'_, LineDocument> {
        self.inner.document.borrow_mut()
    }

    /// Snapshot of all lines.
    pub fn lines(&self) -> Vec<Line> {
        self.document().lines()
    }

    /// Subscribe to line snapshots. The listener is called right away with
    /// the current snapshot and again after every change.
    pub fn subscribe_lines(&self, listener: impl Fn(&[Line]) + 'static) -> Subscription {
        let listener = Rc::new(listener);
        listener(&self.lines());
        self.inner.line_observers.subscribe(move |lines| listener(lines))
    }

    /// Deliver a fresh snapshot to line observers if the replica changed
    /// since the last delivery. Returns whether anything was delivered.
    pub fn publish_lines(&self) -> bool {
        let version = self.document().version();
        {
            let mut published = self.inner.published.borrow_mut();
            if published.as_ref() == Some(&version) {
                return false;
            }
            *published = Some(version);
        }

        let snapshot = self.lines();
        self.inner.line_observers.emit(&snapshot);
        true
    }

    pub(crate) fn presence(&self) -> Ref<'_, PresenceBook> {
        self.inner.presence.borrow()
    }

    pub(crate) fn presence_mut(&self) -> RefMut<'_, PresenceBook> {
        self.inner.presence.borrow_mut()
    }

    /// Subscribe to the participant mapping. Called right away and after
    /// every presence change.
    pub fn subscribe_presence(&self, listener: impl Fn(&Participants) + 'static) -> Subscription {
        let listener = Rc::new(listener);
        listener(&self.presence().participants());
        self.inner.presence_observers.subscribe(move |participants| listener(participants))
    }

    pub(crate) fn publish_presence(&self) {
        let participants = self.presence().participants();
        self.inner.presence_observers.emit(&participants);
    }

    /// Queue a message for the relay. Presence updates replace any queued
    /// presence update, since only the latest state matters.
    pub(crate) fn enqueue(&self, message: ClientMessage) {
        let mut outbox = self.inner.outbox.borrow_mut();
        if matches!(message, ClientMessage::Presence { .. }) {
            outbox.retain(|m| !matches!(m, ClientMessage::Presence { .. }));
        }
        outbox.push(message);
    }

    /// Take pending outgoing messages (drains the queue).
    pub(crate) fn take_outgoing(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.inner.outbox.borrow_mut())
    }

    /// Check if there are pending outgoing messages.
    pub fn has_outgoing(&self) -> bool {
        !self.inner.outbox.borrow().is_empty()
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

//! Live presence of participants.
//!
//! Presence is ephemeral: it is never written to the document, each entry is
//! owned by its author, and an entry disappears as soon as its owner's
//! connection is gone.

use std::collections::BTreeMap;

use kurbo::Point;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::SessionContext;
use crate::line::Color;
use crate::observe::Subscription;
use crate::sync::ClientMessage;

/// Ephemeral state of one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    /// Participant id.
    pub id: String,
    /// Cursor position in canvas space.
    pub point: Point,
    /// Color used for this participant's cursor and strokes.
    pub color: Color,
    /// Whether the pointer is currently over the canvas.
    pub is_active: bool,
}

impl PresenceState {
    /// Fresh state for a participant, with a palette color derived from its id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let color = Color::from_seed(id.as_bytes());
        Self {
            id,
            point: Point::ZERO,
            color,
            is_active: false,
        }
    }
}

/// All known participants keyed by id.
pub type Participants = BTreeMap<String, PresenceState>;

/// Local and remote presence, owned by the [`SessionContext`].
#[derive(Debug, Clone)]
pub(crate) struct PresenceBook {
    pub(crate) local: PresenceState,
    pub(crate) remote: Participants,
}

impl PresenceBook {
    pub(crate) fn new_local() -> Self {
        Self {
            local: PresenceState::new(Uuid::new_v4().to_string()),
            remote: Participants::new(),
        }
    }

    pub(crate) fn participants(&self) -> Participants {
        let mut all = self.remote.clone();
        all.insert(self.local.id.clone(), self.local.clone());
        all
    }
}

/// Tracks the local participant's presence and mirrors everyone else's.
pub struct PresenceTracker {
    context: SessionContext,
}

impl PresenceTracker {
    pub fn new(context: &SessionContext) -> Self {
        Self {
            context: context.clone(),
        }
    }

    /// Current local state.
    pub fn local(&self) -> PresenceState {
        self.context.presence().local.clone()
    }

    /// Id of the local participant.
    pub fn local_id(&self) -> String {
        self.context.presence().local.id.clone()
    }

    /// Pointer entered the canvas.
    pub fn activate(&self) {
        self.update_local(|state| state.is_active = true);
    }

    /// Pointer left the canvas.
    pub fn deactivate(&self) {
        self.update_local(|state| state.is_active = false);
    }

    /// Move the local cursor.
    pub fn update_point(&self, point: Point) {
        self.update_local(|state| state.point = point);
    }

    /// Re-broadcast the local state unchanged, e.g. after (re)joining.
    pub fn announce(&self) {
        let state = self.local();
        self.context.enqueue(ClientMessage::Presence { state });
    }

    fn update_local(&self, update: impl FnOnce(&mut PresenceState)) {
        let state = {
            let mut book = self.context.presence_mut();
            update(&mut book.local);
            book.local.clone()
        };
        self.context.enqueue(ClientMessage::Presence { state });
        self.context.publish_presence();
    }

    /// Every known participant, the local one included.
    pub fn participants(&self) -> Participants {
        self.context.presence().participants()
    }

    /// Every known participant except the local one.
    pub fn others(&self) -> Vec<PresenceState> {
        self.context.presence().remote.values().cloned().collect()
    }

    /// Subscribe to the participant mapping.
    pub fn observe(&self, listener: impl Fn(&Participants) + 'static) -> Subscription {
        self.context.subscribe_presence(listener)
    }

    /// Record a state reported by another participant.
    pub fn apply_remote(&self, state: PresenceState) {
        {
            let mut book = self.context.presence_mut();
            if state.id == book.local.id {
                return;
            }
            book.remote.insert(state.id.clone(), state);
        }
        self.context.publish_presence();
    }

    /// Forget a participant whose connection dropped. Returns whether it was known.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.context.presence_mut().remote.remove(id).is_some();
        if removed {
            log::debug!("Presence removed for {}", id);
            self.context.publish_presence();
        }
        removed
    }

    /// Forget every remote participant, e.g. when the local link drops.
    pub fn clear_remote(&self) {
        let had_remote = {
            let mut book = self.context.presence_mut();
            let had_remote = !book.remote.is_empty();
            book.remote.clear();
            had_remote
        };
        if had_remote {
            self.context.publish_presence();
        }
    }
}

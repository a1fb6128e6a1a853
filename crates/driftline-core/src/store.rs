//! Line creation, stroke recording and the global clear.

use std::time::Instant;

use kurbo::Point;

use crate::context::SessionContext;
use crate::crdt::LineHandle;
use crate::error::{SessionError, SessionResult};
use crate::history::UndoController;
use crate::line::{Line, LineId, LineIds};
use crate::observe::Subscription;
use crate::presence::PresenceTracker;
use crate::throttle::ClearThrottle;

/// Records the local participant's strokes into the shared line collection.
///
/// At most one line is open at a time. Points are committed one by one so
/// peers see the stroke grow while it is drawn.
pub struct LineStore {
    context: SessionContext,
    history: UndoController,
    presence: PresenceTracker,
    throttle: ClearThrottle,
    ids: LineIds,
    /// The line being drawn, if any.
    current: Option<LineHandle>,
}

impl LineStore {
    pub fn new(context: &SessionContext) -> Self {
        Self {
            context: context.clone(),
            history: UndoController::new(context),
            presence: PresenceTracker::new(context),
            throttle: ClearThrottle::new(context.config().clear_cooldown()),
            ids: LineIds::new(),
            current: None,
        }
    }

    /// Start a new stroke at `point` using the current wall clock for its id.
    pub fn start_line(&mut self, point: Point) -> SessionResult<LineId> {
        self.start_line_at(point, chrono::Utc::now().timestamp_millis())
    }

    /// Start a new stroke at `point`, created at `now_ms` (Unix milliseconds).
    ///
    /// Fails with [`SessionError::LineAlreadyOpen`] while another stroke is
    /// still being drawn; the open stroke is left untouched.
    pub fn start_line_at(&mut self, point: Point, now_ms: i64) -> SessionResult<LineId> {
        self.release_if_closed();
        if let Some(open) = &self.current {
            return Err(SessionError::LineAlreadyOpen(open.id().to_string()));
        }

        let line = Line::new(self.ids.next_at(now_ms), point, self.presence.local().color);
        self.history.begin_transaction();
        let created = self.context.document_mut().create_line(&line);
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                self.history.end_transaction();
                return Err(e.into());
            }
        };

        log::debug!("Line {} started", line.id);
        self.current = Some(handle);
        self.context.publish_lines();
        Ok(line.id)
    }

    /// Append a point to the open stroke. Ignored when none is open.
    pub fn add_point(&mut self, point: Point) {
        self.release_if_closed();
        let Some(handle) = &self.current else {
            return;
        };

        let appended = self.context.document_mut().append_point(handle, point);
        if let Err(e) = appended {
            log::warn!("Dropping line {}: {}", handle.id(), e);
            self.current = None;
            self.history.end_transaction();
        }
        self.context.publish_lines();
    }

    /// Mark the open stroke complete and close its transaction. Ignored when
    /// none is open.
    pub fn complete_line(&mut self) {
        self.release_if_closed();
        let Some(handle) = self.current.take() else {
            return;
        };

        if let Err(e) = self.context.document_mut().complete_line(&handle) {
            log::warn!("Failed to complete line {}: {}", handle.id(), e);
        }
        self.history.end_transaction();
        log::debug!("Line {} completed", handle.id());
        self.context.publish_lines();
    }

    /// Remove every line, subject to the clear cooldown.
    pub fn clear_all(&mut self) -> bool {
        self.clear_all_at(Instant::now())
    }

    /// Remove every line as of `now`. Returns whether the clear happened.
    ///
    /// Only a clear that reached the document starts a new cooldown window.
    pub fn clear_all_at(&mut self, now: Instant) -> bool {
        if !self.throttle.is_ready_at(now) {
            log::debug!(
                "Clear refused, {:?} of cooldown left",
                self.throttle.remaining_at(now)
            );
            return false;
        }

        // An open stroke is deleted along with everything else
        self.current = None;
        self.history.begin_transaction();
        let cleared = self.context.document_mut().clear();
        self.history.end_transaction();

        let count = match cleared {
            Ok(count) => count,
            Err(e) => {
                log::warn!("Clear failed: {}", e);
                return false;
            }
        };
        self.throttle.record_at(now);
        log::info!("Cleared {} lines", count);
        self.context.publish_lines();
        true
    }

    /// Undo the most recent local stroke. An open stroke is completed first.
    pub fn undo(&mut self) -> bool {
        self.complete_line();
        self.history.undo()
    }

    /// Redo the most recently undone stroke.
    pub fn redo(&mut self) -> bool {
        self.complete_line();
        self.history.redo()
    }

    /// Subscribe to the ordered line snapshot.
    pub fn observe(&self, listener: impl Fn(&[Line]) + 'static) -> Subscription {
        self.context.subscribe_lines(listener)
    }

    pub fn lines(&self) -> Vec<Line> {
        self.context.lines()
    }

    pub fn len(&self) -> usize {
        self.context.document().line_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the stroke being drawn.
    pub fn current_line(&self) -> Option<&str> {
        self.current.as_ref().map(LineHandle::id)
    }

    pub fn history(&self) -> &UndoController {
        &self.history
    }

    pub fn throttle(&self) -> &ClearThrottle {
        &self.throttle
    }

    // The transaction may have been sealed behind our back (e.g. an undo
    // issued through another UndoController); the handle is then stale.
    fn release_if_closed(&mut self) {
        if self.current.is_some() && !self.history.is_open() {
            if let Some(handle) = self.current.take() {
                log::debug!("Line {} released after its transaction closed", handle.id());
            }
        }
    }
}

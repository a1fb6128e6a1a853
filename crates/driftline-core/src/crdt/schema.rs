//! Loro document schema and operations.

use std::fmt;

use kurbo::Point;
use loro::{ExportMode, LoroDoc, LoroList, LoroMap, LoroResult, LoroValue, UndoManager, VersionVector};

use super::convert::{KEY_IS_COMPLETE, line_from_loro, line_to_loro, push_point};
use crate::config::DEFAULT_MAX_UNDO_STEPS;
use crate::line::{Line, LineId};

/// Key for the lines list in the document.
pub const LINES_KEY: &str = "lines";

/// Attached handle to one line inside the document.
///
/// Held by the author while the stroke is open so points can be appended
/// without searching the list.
#[derive(Clone)]
pub struct LineHandle {
    id: LineId,
    map: LoroMap,
    points: LoroList,
}

impl LineHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for LineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineHandle").field("id", &self.id).finish()
    }
}

/// A CRDT-backed collection of lines.
///
/// This wraps a `LoroDoc` holding a single ordered list of line maps, and an
/// `UndoManager` that only ever reverts operations made by this peer.
pub struct LineDocument {
    /// The underlying Loro document.
    doc: LoroDoc,
    /// Undo manager for local undo/redo.
    undo_manager: UndoManager,
    /// Whether an undo group is currently open.
    grouped: bool,
    steps: StepLog,
    max_steps: usize,
}

impl LineDocument {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self::with_max_undo_steps(DEFAULT_MAX_UNDO_STEPS)
    }

    /// Create a new empty document keeping at most `steps` undo steps.
    pub fn with_max_undo_steps(steps: usize) -> Self {
        Self::from_doc(LoroDoc::new(), steps)
    }

    /// Create a document from a snapshot.
    pub fn from_snapshot(bytes: &[u8]) -> LoroResult<Self> {
        let doc = LoroDoc::new();
        doc.import(bytes)?;
        Ok(Self::from_doc(doc, DEFAULT_MAX_UNDO_STEPS))
    }

    fn from_doc(doc: LoroDoc, steps: usize) -> Self {
        // The item stack stays unbounded so the step log can count items;
        // `steps` caps the step log instead.
        let mut undo_manager = UndoManager::new(&doc);
        // Steps are delimited explicitly, never by timing
        undo_manager.set_merge_interval(0);
        Self {
            doc,
            undo_manager,
            grouped: false,
            steps: StepLog::default(),
            max_steps: steps,
        }
    }

    /// Get the underlying LoroDoc.
    pub fn loro_doc(&self) -> &LoroDoc {
        &self.doc
    }

    /// Peer id of this replica.
    pub fn peer_id(&self) -> u64 {
        self.doc.peer_id()
    }

    fn lines_list(&self) -> LoroList {
        self.doc.get_list(LINES_KEY)
    }

    /// Get the number of lines in the document.
    pub fn line_count(&self) -> usize {
        self.lines_list().len()
    }

    /// Append a new line and commit it as one change.
    pub fn create_line(&mut self, line: &Line) -> LoroResult<LineHandle> {
        let lines = self.lines_list();
        let map = lines.insert_container(lines.len(), LoroMap::new())?;
        let points = line_to_loro(line, &map)?;
        self.doc.commit();

        Ok(LineHandle {
            id: line.id.clone(),
            map,
            points,
        })
    }

    /// Append one point to an open line.
    pub fn append_point(&mut self, handle: &LineHandle, point: Point) -> LoroResult<()> {
        push_point(&handle.points, point)?;
        self.doc.commit();
        Ok(())
    }

    /// Mark a line as finished.
    pub fn complete_line(&mut self, handle: &LineHandle) -> LoroResult<()> {
        handle.map.insert(KEY_IS_COMPLETE, true)?;
        self.doc.commit();
        Ok(())
    }

    /// Remove every line in one change. Returns how many were removed.
    pub fn clear(&mut self) -> LoroResult<usize> {
        let lines = self.lines_list();
        let len = lines.len();
        if len > 0 {
            lines.delete(0, len)?;
            self.doc.commit();
        }
        Ok(len)
    }

    /// Snapshot of all lines in creation order.
    pub fn lines(&self) -> Vec<Line> {
        match self.lines_list().get_deep_value() {
            LoroValue::List(items) => items
                .iter()
                .filter_map(|item| match item {
                    LoroValue::Map(map) => line_from_loro(map),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Get a line by id.
    pub fn line(&self, id: &str) -> Option<Line> {
        self.lines().into_iter().find(|line| line.id == id)
    }

    // --- Replication ---

    /// Export the document as a snapshot (full state).
    pub fn export_snapshot(&self) -> Vec<u8> {
        self.doc.export(ExportMode::Snapshot).unwrap_or_default()
    }

    /// Export incremental updates since a version.
    pub fn export_updates(&self, since: &VersionVector) -> Vec<u8> {
        self.doc.export(ExportMode::updates(since)).unwrap_or_default()
    }

    /// Export every operation this replica knows about.
    pub fn export_all_updates(&self) -> Vec<u8> {
        self.export_updates(&VersionVector::default())
    }

    /// Import updates or a snapshot from another replica.
    pub fn import(&mut self, bytes: &[u8]) -> LoroResult<()> {
        self.doc.import(bytes)?;
        Ok(())
    }

    /// Get the current version vector.
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    // --- Undo/Redo API ---

    /// Undo the last step made by this peer. An open step is ended first.
    /// Returns true if undo was performed, false if nothing to undo.
    pub fn undo(&mut self) -> bool {
        self.end_step();
        let Some(items) = self.steps.undo.pop() else {
            return false;
        };

        let target = self.undo_manager.undo_count().saturating_sub(items);
        let before = self.undo_manager.redo_count();
        while self.undo_manager.undo_count() > target {
            match self.undo_manager.undo() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    log::warn!("Undo failed: {}", e);
                    break;
                }
            }
        }

        let moved = self.undo_manager.redo_count().saturating_sub(before);
        if moved > 0 {
            self.steps.redo.push(moved);
        }
        self.reconcile_steps();
        moved > 0
    }

    /// Redo the last undone step.
    /// Returns true if redo was performed, false if nothing to redo.
    pub fn redo(&mut self) -> bool {
        self.end_step();
        let Some(items) = self.steps.redo.pop() else {
            return false;
        };

        let target = self.undo_manager.redo_count().saturating_sub(items);
        let before = self.undo_manager.undo_count();
        while self.undo_manager.redo_count() > target {
            match self.undo_manager.redo() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    log::warn!("Redo failed: {}", e);
                    break;
                }
            }
        }

        let moved = self.undo_manager.undo_count().saturating_sub(before);
        if moved > 0 {
            self.steps.undo.push(moved);
        }
        self.reconcile_steps();
        moved > 0
    }

    /// Check if undo is available.
    pub fn can_undo(&self) -> bool {
        self.undo_count() > 0
    }

    /// Check if redo is available.
    pub fn can_redo(&self) -> bool {
        self.redo_count() > 0
    }

    /// Get the number of available undo steps. An open step counts once.
    pub fn undo_count(&self) -> usize {
        let loose = self.loose_items();
        let loose = if self.steps.open.is_some() {
            loose.min(1)
        } else {
            loose
        };
        self.steps.undo.len() + loose
    }

    /// Get the number of available redo steps.
    pub fn redo_count(&self) -> usize {
        if self.undo_manager.redo_count() == 0 {
            0
        } else {
            self.steps.redo.len()
        }
    }

    /// Start a new undo step. All changes until `end_step` are undone together,
    /// even when imports from other peers arrive in between.
    pub fn begin_step(&mut self) {
        self.end_step();
        self.steps.open = Some(self.undo_manager.undo_count());
        match self.undo_manager.group_start() {
            Ok(()) => self.grouped = true,
            Err(e) => log::warn!("Failed to open undo group: {}", e),
        }
    }

    /// End the open undo step, if any, and seal it.
    pub fn end_step(&mut self) {
        if self.grouped {
            self.undo_manager.group_end();
            self.grouped = false;
        }
        self.record_checkpoint();
        if let Some(start) = self.steps.open.take() {
            let spanned = self.undo_manager.undo_count().saturating_sub(start);
            if spanned > 0 {
                self.steps.undo.push(spanned);
            }
        }
        self.reconcile_steps();
    }

    /// Whether an undo step is currently open.
    pub fn step_open(&self) -> bool {
        self.steps.open.is_some()
    }

    fn record_checkpoint(&mut self) {
        if let Err(e) = self.undo_manager.record_new_checkpoint() {
            log::warn!("Failed to record undo checkpoint: {}", e);
        }
    }

    /// Undo items not yet attributed to a step.
    fn loose_items(&self) -> usize {
        let tracked = self.steps.floor + self.steps.undo.iter().sum::<usize>();
        self.undo_manager.undo_count().saturating_sub(tracked)
    }

    // Bring the step log back in line with the undo manager's stacks.
    fn reconcile_steps(&mut self) {
        let undo_items = self.undo_manager.undo_count();
        let redo_items = self.undo_manager.redo_count();
        let steps = &mut self.steps;

        steps.floor = steps.floor.min(undo_items);
        fit_steps(&mut steps.undo, undo_items - steps.floor);
        fit_steps(&mut steps.redo, redo_items);

        while steps.undo.len() > self.max_steps {
            steps.floor += steps.undo.remove(0);
        }
    }
}

/// Undo steps as the user sees them.
///
/// Loro ends an open group as soon as an import touches the same
/// containers, after which every commit of the stroke is an undo item of
/// its own. Each entry here counts the items one step spans.
#[derive(Debug, Default)]
struct StepLog {
    undo: Vec<usize>,
    redo: Vec<usize>,
    /// Items below the oldest step that are no longer undoable.
    floor: usize,
    /// Undo item count when the open step began.
    open: Option<usize>,
}

/// Resize a step stack to cover exactly `items` undo items.
fn fit_steps(steps: &mut Vec<usize>, items: usize) {
    let tracked: usize = steps.iter().sum();
    if tracked <= items {
        // Commits made outside a step are one step each
        steps.extend(std::iter::repeat_n(1, items - tracked));
        return;
    }

    // A no-op item is skipped by the undo manager, which then pops the next one
    let mut excess = tracked - items;
    while excess > 0 {
        let Some(top) = steps.pop() else {
            break;
        };
        if top > excess {
            steps.push(top - excess);
            break;
        }
        excess -= top;
    }
}

impl Default for LineDocument {
    fn default() -> Self {
        Self::new()
    }
}

//! Undo/redo over locally authored transactions.

use crate::context::SessionContext;

/// Whether a transaction is currently accepting changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No transaction open; the next change starts a new undo step.
    Idle,
    /// A stroke is in progress and its changes coalesce into one undo step.
    Open,
}

/// Drives the document's peer-scoped undo history.
///
/// Only changes made through this participant's replica are ever undone;
/// strokes imported from peers are invisible to the history.
pub struct UndoController {
    context: SessionContext,
}

impl UndoController {
    pub fn new(context: &SessionContext) -> Self {
        Self {
            context: context.clone(),
        }
    }

    /// Seal whatever came before and start a new undo step.
    pub fn begin_transaction(&self) {
        self.context.document_mut().begin_step();
    }

    /// Seal the open undo step, if any.
    pub fn end_transaction(&self) {
        self.context.document_mut().end_step();
    }

    pub fn state(&self) -> TransactionState {
        if self.context.document().step_open() {
            TransactionState::Open
        } else {
            TransactionState::Idle
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransactionState::Open
    }

    /// Revert the most recent local transaction. An open one is sealed first.
    pub fn undo(&self) -> bool {
        let undone = self.context.document_mut().undo();
        if undone {
            log::debug!("Undo applied");
            self.context.publish_lines();
        }
        undone
    }

    /// Replay the most recently undone transaction.
    pub fn redo(&self) -> bool {
        let redone = self.context.document_mut().redo();
        if redone {
            log::debug!("Redo applied");
            self.context.publish_lines();
        }
        redone
    }

    pub fn can_undo(&self) -> bool {
        self.context.document().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.context.document().can_redo()
    }

    pub fn undo_count(&self) -> usize {
        self.context.document().undo_count()
    }

    pub fn redo_count(&self) -> usize {
        self.context.document().redo_count()
    }
}

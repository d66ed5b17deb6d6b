//! Append-only, server-authoritative action log for a single board.
//!
//! ```text
//! actions:    [1 stroke] [2 rect] [3 clear] [4 circle] [5 view]
//! undone:              {2}                  {4}
//! redo_stack:          [2, 4]  (top = most recently undone)
//! active:     [1]                [3]                   [5]
//! ```
//!
//! Undo never deletes: it hides an action by identity and pushes its id on
//! the redo stack. A `Clear` is an ordinary action, so it can be undone like
//! any other. Every mutation bumps `seq`, the log version used to fence
//! catch-up snapshots.

use std::collections::HashSet;
use thiserror::Error;

use crate::action::{
    Action, ActionId, ActionKind, ActionPayload, BoardId, LogEvent, Snapshot, UserId,
    ViewTransform,
};

/// What happens to the redo stack when a new drawable action is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedoPolicy {
    /// Standard editor semantics: any new drawing commit empties the redo
    /// stack. Undone actions stay hidden.
    #[default]
    ClearOnCommit,
    /// Redo stays available across unrelated commits.
    Preserve,
}

impl RedoPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "clear_on_commit" | "clear" => Some(RedoPolicy::ClearOnCommit),
            "preserve" | "keep" => Some(RedoPolicy::Preserve),
            _ => None,
        }
    }
}

/// Action log errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("action {0} is unknown or already undone")]
    NotFound(ActionId),
    #[error("action {0} is a view transform and cannot be undone")]
    NotUndoable(ActionId),
    #[error("nothing to redo")]
    EmptyRedo,
    #[error("log event out of order: expected action {expected}, got {got}")]
    OutOfOrder { expected: ActionId, got: ActionId },
    #[error("action belongs to board {got}, log is for board {expected}")]
    WrongBoard { expected: BoardId, got: BoardId },
}

/// Committed actions of one board plus the undo/redo bookkeeping.
#[derive(Debug, Clone)]
pub struct ActionLog {
    board_id: BoardId,
    /// Commit order; `actions[i].id == i + 1`.
    actions: Vec<Action>,
    /// Hidden actions. Disjoint from the active set by construction.
    undone: HashSet<ActionId>,
    /// Redo candidates, most recently undone last. Always a subset of `undone`.
    redo_stack: Vec<ActionId>,
    seq: u64,
    redo_policy: RedoPolicy,
}

impl ActionLog {
    pub fn new(board_id: BoardId) -> Self {
        Self::with_policy(board_id, RedoPolicy::default())
    }

    pub fn with_policy(board_id: BoardId, redo_policy: RedoPolicy) -> Self {
        Self {
            board_id,
            actions: Vec::new(),
            undone: HashSet::new(),
            redo_stack: Vec::new(),
            seq: 0,
            redo_policy,
        }
    }

    /// Rebuild a log from persisted events.
    pub fn replay<'a>(
        board_id: BoardId,
        redo_policy: RedoPolicy,
        events: impl IntoIterator<Item = &'a LogEvent>,
    ) -> Result<Self, LogError> {
        let mut log = Self::with_policy(board_id, redo_policy);
        for event in events {
            log.apply(event)?;
        }
        Ok(log)
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    /// Current log version (number of events applied).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn redo_policy(&self) -> RedoPolicy {
        self.redo_policy
    }

    /// Number of actions ever committed.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn next_id(&self) -> ActionId {
        self.actions.len() as ActionId + 1
    }

    pub fn get(&self, id: ActionId) -> Option<&Action> {
        let index = id.checked_sub(1)?;
        self.actions.get(usize::try_from(index).ok()?)
    }

    pub fn is_active(&self, id: ActionId) -> bool {
        self.get(id).is_some() && !self.undone.contains(&id)
    }

    pub fn is_undone(&self, id: ActionId) -> bool {
        self.undone.contains(&id)
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Commit a new action, assigning the next id.
    pub fn append(
        &mut self,
        author_id: impl Into<UserId>,
        payload: ActionPayload,
        committed_at: u64,
    ) -> Action {
        let action = self.prepare(author_id, payload, committed_at);
        self.push(action.clone());
        action
    }

    /// The action [`ActionLog::append`] would commit, without committing it.
    pub fn prepare(
        &self,
        author_id: impl Into<UserId>,
        payload: ActionPayload,
        committed_at: u64,
    ) -> Action {
        Action {
            id: self.next_id(),
            board_id: self.board_id,
            author_id: author_id.into(),
            committed_at,
            payload,
        }
    }

    fn push(&mut self, action: Action) {
        if action.kind().is_drawable() && self.redo_policy == RedoPolicy::ClearOnCommit {
            self.redo_stack.clear();
        }
        self.actions.push(action);
        self.seq += 1;
    }

    /// Hide the action with the given id.
    pub fn mark_undone(&mut self, id: ActionId) -> Result<(), LogError> {
        let kind = self.get(id).ok_or(LogError::NotFound(id))?.kind();
        if kind == ActionKind::ViewTransform {
            return Err(LogError::NotUndoable(id));
        }
        if !self.undone.insert(id) {
            return Err(LogError::NotFound(id));
        }
        self.redo_stack.push(id);
        self.seq += 1;
        Ok(())
    }

    /// Re-activate the most recently undone action, whoever undid it.
    pub fn mark_redone(&mut self) -> Result<Action, LogError> {
        let action = self.peek_redo().cloned().ok_or(LogError::EmptyRedo)?;
        self.redo_stack.pop();
        self.undone.remove(&action.id);
        self.seq += 1;
        Ok(action)
    }

    /// The action [`ActionLog::mark_redone`] would re-activate.
    pub fn peek_redo(&self) -> Option<&Action> {
        self.redo_stack.last().and_then(|id| self.get(*id))
    }

    /// Most recent active action that undo would hide.
    pub fn last_undoable(&self) -> Option<ActionId> {
        self.actions
            .iter()
            .rev()
            .find(|a| a.kind().is_drawable() && !self.undone.contains(&a.id))
            .map(|a| a.id)
    }

    /// Active actions in commit order, view transforms included.
    pub fn active(&self) -> impl Iterator<Item = &Action> + '_ {
        self.actions.iter().filter(|a| !self.undone.contains(&a.id))
    }

    /// Drawable actions that contribute to the current picture: everything
    /// from the most recent active `Clear` (inclusive) onwards.
    pub fn visible(&self) -> Vec<&Action> {
        let drawable: Vec<&Action> = self.active().filter(|a| a.kind().is_drawable()).collect();
        let start = drawable
            .iter()
            .rposition(|a| a.kind() == ActionKind::Clear)
            .unwrap_or(0);
        drawable[start..].to_vec()
    }

    /// Latest active pan/zoom.
    pub fn view_transform(&self) -> Option<ViewTransform> {
        self.actions
            .iter()
            .rev()
            .filter(|a| !self.undone.contains(&a.id))
            .find_map(|a| match &a.payload {
                ActionPayload::ViewTransform(vt) => Some(*vt),
                _ => None,
            })
    }

    /// Active drawable sequence plus the latest view transform.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            board_id: self.board_id,
            seq: self.seq,
            actions: self
                .active()
                .filter(|a| a.kind().is_drawable())
                .cloned()
                .collect(),
            view_transform: self.view_transform(),
        }
    }

    /// Apply a persisted event. Used when rehydrating a board.
    pub fn apply(&mut self, event: &LogEvent) -> Result<(), LogError> {
        match event {
            LogEvent::Committed(action) => {
                if action.board_id != self.board_id {
                    return Err(LogError::WrongBoard {
                        expected: self.board_id,
                        got: action.board_id,
                    });
                }
                if action.id != self.next_id() {
                    return Err(LogError::OutOfOrder {
                        expected: self.next_id(),
                        got: action.id,
                    });
                }
                self.push(action.clone());
                Ok(())
            }
            LogEvent::Undone(id) => self.mark_undone(*id),
            LogEvent::Redone(action) => {
                // Trust the event over the local redo stack: the log may have
                // been written under a different redo policy.
                if !self.undone.remove(&action.id) {
                    return Err(LogError::NotFound(action.id));
                }
                self.redo_stack.retain(|id| *id != action.id);
                self.seq += 1;
                Ok(())
            }
        }
    }
}

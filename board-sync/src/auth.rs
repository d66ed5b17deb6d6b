//! Edit permission checks.
//!
//! The coordinator asks the [`Authorizer`] on every mutating request, so a
//! revoked grant takes effect on the very next submission.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use crate::action::{BoardId, UserId};

/// Decides whether a user may mutate a board.
pub trait Authorizer: Send + Sync {
    fn can_edit(&self, user_id: &str, board_id: BoardId) -> bool;
}

/// Every user may edit every board.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_edit(&self, _user_id: &str, _board_id: BoardId) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    #[error("board {0} has no registered owner")]
    UnknownBoard(BoardId),
    #[error("only the board owner can change permissions, not {0}")]
    NotOwner(UserId),
}

#[derive(Debug, Clone)]
struct BoardPermissions {
    owner: UserId,
    /// At most one non-owner holds edit rights at a time.
    editor: Option<UserId>,
}

/// Owner-managed permissions: the owner always edits and may hand edit
/// rights to one other user at a time.
#[derive(Debug, Default)]
pub struct PermissionTable {
    boards: RwLock<HashMap<BoardId, BoardPermissions>>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a board and its owner. Re-registering resets grants.
    pub fn register_board(&self, board_id: BoardId, owner: impl Into<UserId>) {
        let owner = owner.into();
        log::debug!("Board {board_id} owned by {owner}");
        self.write().insert(
            board_id,
            BoardPermissions {
                owner,
                editor: None,
            },
        );
    }

    pub fn owner(&self, board_id: BoardId) -> Option<UserId> {
        self.read().get(&board_id).map(|p| p.owner.clone())
    }

    /// Current non-owner editor, if any.
    pub fn editor(&self, board_id: BoardId) -> Option<UserId> {
        self.read().get(&board_id).and_then(|p| p.editor.clone())
    }

    /// Give `user_id` edit rights, revoking anyone else's.
    pub fn grant(
        &self,
        board_id: BoardId,
        requested_by: &str,
        user_id: impl Into<UserId>,
    ) -> Result<(), PermissionError> {
        let mut boards = self.write();
        let perms = boards
            .get_mut(&board_id)
            .ok_or(PermissionError::UnknownBoard(board_id))?;
        if perms.owner != requested_by {
            return Err(PermissionError::NotOwner(requested_by.to_string()));
        }

        let user_id = user_id.into();
        if let Some(previous) = perms.editor.replace(user_id.clone()) {
            if previous != user_id {
                log::info!("Edit rights on {board_id} moved from {previous} to {user_id}");
            }
        } else {
            log::info!("Edit rights on {board_id} granted to {user_id}");
        }
        Ok(())
    }

    /// Withdraw `user_id`'s edit rights. A no-op if they hold none.
    pub fn revoke(
        &self,
        board_id: BoardId,
        requested_by: &str,
        user_id: &str,
    ) -> Result<(), PermissionError> {
        let mut boards = self.write();
        let perms = boards
            .get_mut(&board_id)
            .ok_or(PermissionError::UnknownBoard(board_id))?;
        if perms.owner != requested_by {
            return Err(PermissionError::NotOwner(requested_by.to_string()));
        }

        if perms.editor.as_deref() == Some(user_id) {
            perms.editor = None;
            log::info!("Edit rights on {board_id} revoked from {user_id}");
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<BoardId, BoardPermissions>> {
        self.boards.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<BoardId, BoardPermissions>> {
        self.boards.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Authorizer for PermissionTable {
    fn can_edit(&self, user_id: &str, board_id: BoardId) -> bool {
        self.read().get(&board_id).is_some_and(|p| {
            p.owner == user_id || p.editor.as_deref() == Some(user_id)
        })
    }
}

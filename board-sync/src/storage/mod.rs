//! Durable storage for board logs.
//!
//! Architecture:
//! ```text
//! ┌────────────────────┐  append(board, seq, event)  ┌──────────────┐
//! │ SessionCoordinator │ ──────────────────────────► │ ActionStore  │
//! │ (per-board lock)   │                             │ RocksStore / │
//! └─────────┬──────────┘                             │ MemoryStore  │
//!           │ open_board                             └──────┬───────┘
//!           ▼                                               │
//! ┌────────────────────┐       load_all(board)              │
//! │ ActionLog::replay  │ ◄──────────────────────────────────┘
//! └────────────────────┘
//! ```
//!
//! The store records every [`LogEvent`] (commits, undos and redos) so that a
//! rehydrated board has the same active set and the same redo stack it had
//! before the restart.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{BoardMetadata, RocksStore, StoreConfig};

use thiserror::Error;

use crate::action::{BoardId, LogEvent};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    DatabaseError(String),
    #[error("board not found: {0}")]
    NotFound(BoardId),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("compression error: {0}")]
    CompressionError(String),
    /// The backing store cannot be reached at all.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Append-only event storage keyed by board.
///
/// Implementations must return events from [`ActionStore::load_all`] in the
/// order of their `seq`.
pub trait ActionStore: Send + Sync {
    /// Persist one event at log version `seq`.
    fn append(&self, board_id: BoardId, seq: u64, event: &LogEvent) -> Result<(), StoreError>;

    /// Every event ever appended for the board, oldest first. An unknown
    /// board yields an empty list.
    fn load_all(&self, board_id: BoardId) -> Result<Vec<LogEvent>, StoreError>;

    /// Boards that have at least one stored event.
    fn list_boards(&self) -> Result<Vec<BoardId>, StoreError>;

    /// Drop a board and all of its events.
    fn delete_board(&self, board_id: BoardId) -> Result<(), StoreError>;
}

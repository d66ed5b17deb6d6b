//! In-process [`ActionStore`], used by tests and by servers started without
//! a data directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{ActionStore, StoreError};
use crate::action::{BoardId, LogEvent};

#[derive(Default)]
pub struct MemoryStore {
    boards: Mutex<HashMap<BoardId, Vec<(u64, LogEvent)>>>,
    /// When set, every call fails with `StoreError::Unavailable`.
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store going away (or coming back).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of events stored for a board.
    pub fn event_count(&self, board_id: BoardId) -> usize {
        self.lock()
            .map(|boards| boards.get(&board_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<BoardId, Vec<(u64, LogEvent)>>>, StoreError> {
        self.boards
            .lock()
            .map_err(|_| StoreError::DatabaseError("memory store lock poisoned".into()))
    }
}

impl ActionStore for MemoryStore {
    fn append(&self, board_id: BoardId, seq: u64, event: &LogEvent) -> Result<(), StoreError> {
        self.check_online()?;
        let mut boards = self.lock()?;
        let events = boards.entry(board_id).or_default();
        // Keep seq order even if a caller retries an older write.
        match events.binary_search_by_key(&seq, |(s, _)| *s) {
            Ok(index) => events[index] = (seq, event.clone()),
            Err(index) => events.insert(index, (seq, event.clone())),
        }
        Ok(())
    }

    fn load_all(&self, board_id: BoardId) -> Result<Vec<LogEvent>, StoreError> {
        self.check_online()?;
        let boards = self.lock()?;
        Ok(boards
            .get(&board_id)
            .map(|events| events.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default())
    }

    fn list_boards(&self) -> Result<Vec<BoardId>, StoreError> {
        self.check_online()?;
        Ok(self.lock()?.keys().copied().collect())
    }

    fn delete_board(&self, board_id: BoardId) -> Result<(), StoreError> {
        self.check_online()?;
        self.lock()?.remove(&board_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_append_load_in_seq_order() {
        let store = MemoryStore::new();
        let board = Uuid::new_v4();

        store.append(board, 2, &LogEvent::Undone(1)).unwrap();
        store.append(board, 1, &LogEvent::Undone(7)).unwrap();

        let events = store.load_all(board).unwrap();
        assert_eq!(events, vec![LogEvent::Undone(7), LogEvent::Undone(1)]);
        assert_eq!(store.event_count(board), 2);
    }

    #[test]
    fn test_unknown_board_is_empty() {
        let store = MemoryStore::new();
        assert!(store.load_all(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn test_offline_fails_every_call() {
        let store = MemoryStore::new();
        let board = Uuid::new_v4();
        store.set_offline(true);

        assert!(matches!(store.load_all(board), Err(StoreError::Unavailable(_))));
        assert!(matches!(
            store.append(board, 1, &LogEvent::Undone(1)),
            Err(StoreError::Unavailable(_))
        ));

        store.set_offline(false);
        assert!(store.load_all(board).is_ok());
    }

    #[test]
    fn test_list_and_delete() {
        let store = MemoryStore::new();
        let board = Uuid::new_v4();
        store.append(board, 1, &LogEvent::Undone(1)).unwrap();

        assert_eq!(store.list_boards().unwrap(), vec![board]);
        store.delete_board(board).unwrap();
        assert!(store.list_boards().unwrap().is_empty());
    }
}

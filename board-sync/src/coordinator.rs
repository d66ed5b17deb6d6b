//! Single writer per board.
//!
//! ```text
//!            submit / undo / redo / clear
//! conn A ──┐            │
//! conn B ──┼──► boards[board_id] ──► Mutex<OpenBoard> ──► ActionStore.append
//! conn C ──┘   (RwLock registry)          │                      │ ok
//!                                         │ ◄────── ActionLog.apply
//!                                         └────────────► BroadcastRouter.publish
//! ```
//!
//! Every mutation of a board takes that board's mutex, builds the next
//! [`LogEvent`], persists it, applies it to the [`ActionLog`] and publishes
//! it, all before the lock is released. An event that fails to persist is
//! never applied or published, so store order, broadcast order and log order
//! are identical and the store never trails the log. Boards never share a
//! lock; the registry lock is only held for map lookups and inserts, never
//! across storage I/O. Store calls run on the blocking pool.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::action::{
    now_millis, ActionId, ActionKind, ActionPayload, BoardId, CommitEvent, ConnectionId,
    LogEvent, Origin, Snapshot, UserId,
};
use crate::action_log::{ActionLog, RedoPolicy};
use crate::auth::Authorizer;
use crate::broadcast::BroadcastRouter;
use crate::protocol::{Confirmation, RejectReason};
use crate::storage::{ActionStore, StoreError};

/// Temp-id confirmations remembered per connection for catch-up.
const CONFIRMATIONS_PER_CONNECTION: usize = 64;

/// Outcome of an accepted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    /// Action the mutation committed, undid or redid
    pub id: ActionId,
    /// Board log version after the mutation
    pub seq: u64,
}

/// Who is asking for a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: UserId,
    /// Set when the request arrived over a connection; used to route
    /// `clientTempId` back to it.
    pub connection_id: Option<ConnectionId>,
}

impl Participant {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            connection_id: None,
        }
    }

    pub fn on_connection(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    fn origin(&self, client_temp_id: Option<String>) -> Option<Origin> {
        self.connection_id.map(|connection_id| Origin {
            connection_id,
            client_temp_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    /// Durable storage could not produce the board's log.
    #[error("board {board_id} is unavailable: {reason}")]
    BoardUnavailable { board_id: BoardId, reason: String },
}

/// Coordinator counters.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub commits: u64,
    pub undos: u64,
    pub redos: u64,
    pub rejections: u64,
    pub persist_failures: u64,
    pub boards_opened: u64,
    pub open_boards: usize,
}

#[derive(Default)]
struct AtomicCoordinatorStats {
    commits: AtomicU64,
    undos: AtomicU64,
    redos: AtomicU64,
    rejections: AtomicU64,
    persist_failures: AtomicU64,
    boards_opened: AtomicU64,
}

/// A board that is loaded and accepting mutations.
struct OpenBoard {
    log: ActionLog,
    /// Recent commits per submitting connection, oldest first.
    confirmations: HashMap<ConnectionId, VecDeque<Confirmation>>,
}

impl OpenBoard {
    fn new(log: ActionLog) -> Self {
        Self {
            log,
            confirmations: HashMap::new(),
        }
    }

    fn remember(&mut self, origin: Option<&Origin>, id: ActionId) {
        let Some(Origin {
            connection_id,
            client_temp_id: Some(client_temp_id),
        }) = origin
        else {
            return;
        };
        let recent = self.confirmations.entry(*connection_id).or_default();
        if recent.len() == CONFIRMATIONS_PER_CONNECTION {
            recent.pop_front();
        }
        recent.push_back(Confirmation {
            client_temp_id: client_temp_id.clone(),
            id,
        });
    }
}

/// One registry entry. `None` means the board is still loading or has been
/// closed; either way it accepts no mutations.
struct BoardSession {
    state: Mutex<Option<OpenBoard>>,
}

/// Owns every open board's [`ActionLog`] and linearizes its mutations.
pub struct SessionCoordinator {
    boards: RwLock<HashMap<BoardId, Arc<BoardSession>>>,
    router: Arc<BroadcastRouter>,
    store: Arc<dyn ActionStore>,
    authorizer: Arc<dyn Authorizer>,
    redo_policy: RedoPolicy,
    stats: AtomicCoordinatorStats,
}

impl SessionCoordinator {
    pub fn new(
        router: Arc<BroadcastRouter>,
        store: Arc<dyn ActionStore>,
        authorizer: Arc<dyn Authorizer>,
        redo_policy: RedoPolicy,
    ) -> Self {
        Self {
            boards: RwLock::new(HashMap::new()),
            router,
            store,
            authorizer,
            redo_policy,
            stats: AtomicCoordinatorStats::default(),
        }
    }

    pub fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }

    pub fn redo_policy(&self) -> RedoPolicy {
        self.redo_policy
    }

    // ─── Board lifecycle ──────────────────────────────────────────────

    /// Make a board available, rehydrating it from storage on first open.
    ///
    /// Idempotent. Fails only when storage cannot produce a consistent log.
    pub async fn open_board(&self, board_id: BoardId) -> Result<(), CoordinatorError> {
        let session = {
            let mut boards = self.boards.write().await;
            boards
                .entry(board_id)
                .or_insert_with(|| {
                    Arc::new(BoardSession {
                        state: Mutex::new(None),
                    })
                })
                .clone()
        };

        let mut guard = session.state.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        match self.load(board_id).await {
            Ok(log) => {
                log::info!(
                    "Opened board {board_id} ({} actions, seq {})",
                    log.len(),
                    log.seq()
                );
                *guard = Some(OpenBoard::new(log));
                self.stats.boards_opened.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                drop(guard);
                let mut boards = self.boards.write().await;
                if boards
                    .get(&board_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &session))
                {
                    boards.remove(&board_id);
                }
                log::error!("{e}");
                Err(e)
            }
        }
    }

    async fn load(&self, board_id: BoardId) -> Result<ActionLog, CoordinatorError> {
        let unavailable = |reason: String| CoordinatorError::BoardUnavailable { board_id, reason };
        let store = self.store.clone();
        let events = tokio::task::spawn_blocking(move || store.load_all(board_id))
            .await
            .map_err(|e| unavailable(e.to_string()))?
            .map_err(|e| unavailable(e.to_string()))?;
        ActionLog::replay(board_id, self.redo_policy, &events)
            .map_err(|e| unavailable(format!("stored log is inconsistent: {e}")))
    }

    /// Close a board. In-flight mutations finish first; later ones are
    /// rejected with `unknown_board`.
    pub async fn close_board(&self, board_id: BoardId) -> bool {
        let mut boards = self.boards.write().await;
        self.close_locked(&mut boards, board_id).await
    }

    /// Close the board if no connection is subscribed to it. The next
    /// [`SessionCoordinator::open_board`] rehydrates it from storage.
    pub async fn evict_if_idle(&self, board_id: BoardId) -> bool {
        // Registry lock first, so a joiner that subscribed after this check
        // reopens the board instead of using the evicted session.
        let mut boards = self.boards.write().await;
        if self.router.subscriber_count(board_id).await > 0 {
            return false;
        }
        let closed = self.close_locked(&mut boards, board_id).await;
        if closed {
            log::info!("Board {board_id} evicted (no subscribers)");
        }
        closed
    }

    async fn close_locked(
        &self,
        boards: &mut HashMap<BoardId, Arc<BoardSession>>,
        board_id: BoardId,
    ) -> bool {
        match boards.remove(&board_id) {
            Some(session) => {
                session.state.lock().await.take();
                log::debug!("Board {board_id} closed");
                true
            }
            None => false,
        }
    }

    /// Drop the confirmations kept for a connection that left the board.
    pub async fn forget_connection(&self, board_id: BoardId, connection_id: ConnectionId) {
        let Some(session) = self.boards.read().await.get(&board_id).cloned() else {
            return;
        };
        if let Some(board) = session.state.lock().await.as_mut() {
            board.confirmations.remove(&connection_id);
        }
    }

    pub async fn is_open(&self, board_id: BoardId) -> bool {
        self.boards.read().await.contains_key(&board_id)
    }

    pub async fn board_count(&self) -> usize {
        self.boards.read().await.len()
    }

    // ─── Mutations ────────────────────────────────────────────────────
    //
    // A mutation whose store write has started must not be cancelled: the
    // event may be durable without having reached the log.

    /// Commit an action received from the wire.
    pub async fn submit(
        &self,
        board_id: BoardId,
        participant: &Participant,
        client_temp_id: Option<String>,
        kind: ActionKind,
        payload: Value,
    ) -> Result<Commit, RejectReason> {
        // Resolve the board and permission before looking at the payload.
        let session = self.session(board_id).await?;
        let mut guard = session.state.lock().await;
        let board = guard.as_mut().ok_or_else(|| self.reject(RejectReason::UnknownBoard))?;
        self.authorize(board_id, participant)?;

        let payload = ActionPayload::from_wire(kind, payload).map_err(|e| {
            log::debug!("Rejected {} on board {board_id}: {e}", kind.as_str());
            self.reject(RejectReason::MalformedPayload)
        })?;

        self.commit(board, participant, client_temp_id, payload).await
    }

    /// Commit an already-typed payload.
    pub async fn submit_payload(
        &self,
        board_id: BoardId,
        participant: &Participant,
        client_temp_id: Option<String>,
        payload: ActionPayload,
    ) -> Result<Commit, RejectReason> {
        let session = self.session(board_id).await?;
        let mut guard = session.state.lock().await;
        let board = guard.as_mut().ok_or_else(|| self.reject(RejectReason::UnknownBoard))?;
        self.authorize(board_id, participant)?;

        if let Err(e) = payload.validate() {
            log::debug!("Rejected payload on board {board_id}: {e}");
            return Err(self.reject(RejectReason::MalformedPayload));
        }

        self.commit(board, participant, client_temp_id, payload).await
    }

    /// Commit a `Clear`. It is an ordinary action, so undo brings the
    /// drawing back.
    pub async fn clear(
        &self,
        board_id: BoardId,
        participant: &Participant,
    ) -> Result<Commit, RejectReason> {
        self.submit_payload(board_id, participant, None, ActionPayload::Clear)
            .await
    }

    /// Hide the most recent active drawing action, whoever authored it.
    pub async fn undo(
        &self,
        board_id: BoardId,
        participant: &Participant,
    ) -> Result<Commit, RejectReason> {
        let session = self.session(board_id).await?;
        let mut guard = session.state.lock().await;
        let board = guard.as_mut().ok_or_else(|| self.reject(RejectReason::UnknownBoard))?;
        self.authorize(board_id, participant)?;

        let id = board
            .log
            .last_undoable()
            .ok_or_else(|| self.reject(RejectReason::EmptyUndo))?;

        let seq = self
            .record(&mut board.log, LogEvent::Undone(id), participant.origin(None))
            .await?;
        self.stats.undos.fetch_add(1, Ordering::Relaxed);
        log::debug!("Board {board_id}: {} undid action {id}", participant.user_id);
        Ok(Commit { id, seq })
    }

    /// Re-activate the most recently undone action.
    pub async fn redo(
        &self,
        board_id: BoardId,
        participant: &Participant,
    ) -> Result<Commit, RejectReason> {
        let session = self.session(board_id).await?;
        let mut guard = session.state.lock().await;
        let board = guard.as_mut().ok_or_else(|| self.reject(RejectReason::UnknownBoard))?;
        self.authorize(board_id, participant)?;

        let action = board
            .log
            .peek_redo()
            .cloned()
            .ok_or_else(|| self.reject(RejectReason::EmptyRedo))?;

        let id = action.id;
        let seq = self
            .record(&mut board.log, LogEvent::Redone(action), participant.origin(None))
            .await?;
        self.stats.redos.fetch_add(1, Ordering::Relaxed);
        log::debug!("Board {board_id}: {} redid action {id}", participant.user_id);
        Ok(Commit { id, seq })
    }

    /// Point-in-time state of a board.
    pub async fn snapshot(&self, board_id: BoardId) -> Result<Snapshot, RejectReason> {
        let session = self.session(board_id).await?;
        let guard = session.state.lock().await;
        guard
            .as_ref()
            .map(|board| board.log.snapshot())
            .ok_or(RejectReason::UnknownBoard)
    }

    /// Snapshot plus the commits this connection made, taken atomically.
    pub async fn snapshot_for(
        &self,
        board_id: BoardId,
        connection_id: ConnectionId,
    ) -> Result<(Snapshot, Vec<Confirmation>), RejectReason> {
        let session = self.session(board_id).await?;
        let guard = session.state.lock().await;
        let board = guard.as_ref().ok_or(RejectReason::UnknownBoard)?;
        let confirmations = board
            .confirmations
            .get(&connection_id)
            .map(|recent| recent.iter().cloned().collect())
            .unwrap_or_default();
        Ok((board.log.snapshot(), confirmations))
    }

    pub async fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            commits: self.stats.commits.load(Ordering::Relaxed),
            undos: self.stats.undos.load(Ordering::Relaxed),
            redos: self.stats.redos.load(Ordering::Relaxed),
            rejections: self.stats.rejections.load(Ordering::Relaxed),
            persist_failures: self.stats.persist_failures.load(Ordering::Relaxed),
            boards_opened: self.stats.boards_opened.load(Ordering::Relaxed),
            open_boards: self.board_count().await,
        }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    async fn session(&self, board_id: BoardId) -> Result<Arc<BoardSession>, RejectReason> {
        self.boards
            .read()
            .await
            .get(&board_id)
            .cloned()
            .ok_or_else(|| self.reject(RejectReason::UnknownBoard))
    }

    /// Asked on every mutation; grants can change mid-session.
    fn authorize(&self, board_id: BoardId, participant: &Participant) -> Result<(), RejectReason> {
        if self.authorizer.can_edit(&participant.user_id, board_id) {
            Ok(())
        } else {
            log::debug!(
                "Board {board_id}: {} may not edit",
                participant.user_id
            );
            Err(self.reject(RejectReason::PermissionDenied))
        }
    }

    fn reject(&self, reason: RejectReason) -> RejectReason {
        self.stats.rejections.fetch_add(1, Ordering::Relaxed);
        reason
    }

    async fn commit(
        &self,
        board: &mut OpenBoard,
        participant: &Participant,
        client_temp_id: Option<String>,
        payload: ActionPayload,
    ) -> Result<Commit, RejectReason> {
        let board_id = board.log.board_id();
        let action = board
            .log
            .prepare(participant.user_id.clone(), payload, now_millis());
        let id = action.id;
        log::debug!(
            "Board {board_id}: committing {} {id} by {}",
            action.kind().as_str(),
            action.author_id
        );

        let origin = participant.origin(client_temp_id);
        let seq = self
            .record(&mut board.log, LogEvent::Committed(action), origin.clone())
            .await?;
        board.remember(origin.as_ref(), id);
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        Ok(Commit { id, seq })
    }

    /// Persist `event` as the log's next version, then apply and publish
    /// it. Caller holds the board lock. On a storage failure the log is
    /// left untouched.
    async fn record(
        &self,
        log: &mut ActionLog,
        event: LogEvent,
        origin: Option<Origin>,
    ) -> Result<u64, RejectReason> {
        let board_id = log.board_id();
        let seq = log.seq() + 1;

        let store = self.store.clone();
        let persisted = tokio::task::spawn_blocking(move || {
            let result = store.append(board_id, seq, &event);
            result.map(|()| event)
        })
        .await
        .unwrap_or_else(|e| Err(StoreError::Unavailable(e.to_string())));

        let event = match persisted {
            Ok(event) => event,
            Err(e) => {
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to persist event {seq} for board {board_id}: {e}");
                return Err(self.reject(RejectReason::StorageUnavailable));
            }
        };

        if let Err(e) = log.apply(&event) {
            // Only reachable if the event was built from a stale view of the log.
            log::error!("Board {board_id}: persisted event {seq} does not apply: {e}");
            return Err(self.reject(RejectReason::StorageUnavailable));
        }

        self.router
            .publish(CommitEvent {
                board_id,
                seq,
                event,
                origin,
            })
            .await;
        Ok(seq)
    }
}

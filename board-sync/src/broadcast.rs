//! Per-board fan-out of commit events to subscribed connections.
//!
//! Uses one tokio broadcast channel per board, so a publish is a single
//! non-blocking send no matter how many connections listen. Each connection
//! gets an independent receiver buffering up to `capacity` events; a
//! connection that falls further behind observes [`SubscriptionError::Lagged`]
//! and must catch up from a fresh snapshot. Slow readers never hold up the
//! publisher or each other.
//!
//! ```text
//! SessionCoordinator ── publish(board A) ──► channel A ──┬─► conn 1
//!                                                        ├─► conn 2
//!                                                        └─► conn 3
//!                    ── publish(board B) ──► channel B ──┴─► conn 4
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, RwLock};

use crate::action::{BoardId, CommitEvent, ConnectionId};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_published: u64,
    pub lag_incidents: u64,
    pub active_subscribers: usize,
    pub active_boards: usize,
}

/// Hot-path counters, updated without taking the router lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    events_published: AtomicU64,
    lag_incidents: AtomicU64,
}

/// Delivery failures seen by a single subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The subscriber's buffer overflowed; `n` events were skipped.
    #[error("subscriber lagged by {0} events")]
    Lagged(u64),
    /// The board channel is gone (no more publishers or unsubscribed).
    #[error("subscription closed")]
    Closed,
}

/// A connection's live feed of commit events for one board.
pub struct Subscription {
    board_id: BoardId,
    connection_id: ConnectionId,
    receiver: broadcast::Receiver<Arc<CommitEvent>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    /// Wait for the next event, in commit order.
    pub async fn recv(&mut self) -> Result<Arc<CommitEvent>, SubscriptionError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(RecvError::Lagged(n)) => {
                self.stats.lag_incidents.fetch_add(1, Ordering::Relaxed);
                Err(SubscriptionError::Lagged(n))
            }
            Err(RecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }

    /// Non-blocking variant; `Ok(None)` when nothing is buffered.
    pub fn try_recv(&mut self) -> Result<Option<Arc<CommitEvent>>, SubscriptionError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Lagged(n)) => {
                self.stats.lag_incidents.fetch_add(1, Ordering::Relaxed);
                Err(SubscriptionError::Lagged(n))
            }
            Err(TryRecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

/// Fan-out channel and subscriber set for one board.
struct BoardChannel {
    sender: broadcast::Sender<Arc<CommitEvent>>,
    subscribers: HashSet<ConnectionId>,
}

impl BoardChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct RouterState {
    boards: HashMap<BoardId, BoardChannel>,
    /// Each connection listens to at most one board.
    connections: HashMap<ConnectionId, BoardId>,
}

/// Routes commit events to every connection subscribed to a board.
///
/// `subscribe`, `unsubscribe` and `publish` are each atomic with respect to
/// the subscriber set; callers need no extra locking.
pub struct BroadcastRouter {
    state: RwLock<RouterState>,
    /// Events buffered per subscriber before it is considered lagging
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastRouter {
    /// Create a router whose per-connection buffers hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(RouterState::default()),
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Subscribe `connection_id` to live events of `board_id`.
    ///
    /// Only events published after this call are delivered. A connection that
    /// was subscribed elsewhere is moved.
    pub async fn subscribe(&self, board_id: BoardId, connection_id: ConnectionId) -> Subscription {
        let mut state = self.state.write().await;
        self.attach(&mut state, board_id, connection_id)
    }

    /// Like [`BroadcastRouter::subscribe`], but refuses when the board
    /// already has `max_subscribers` other connections. The check and the
    /// insert happen under one lock.
    pub async fn subscribe_within(
        &self,
        board_id: BoardId,
        connection_id: ConnectionId,
        max_subscribers: usize,
    ) -> Option<Subscription> {
        let mut state = self.state.write().await;
        let others = state.boards.get(&board_id).map_or(0, |channel| {
            channel.subscribers.len() - usize::from(channel.subscribers.contains(&connection_id))
        });
        if others >= max_subscribers {
            log::debug!("Board {board_id} is full ({others} subscribers); refusing {connection_id}");
            return None;
        }
        Some(self.attach(&mut state, board_id, connection_id))
    }

    fn attach(
        &self,
        state: &mut RouterState,
        board_id: BoardId,
        connection_id: ConnectionId,
    ) -> Subscription {
        Self::detach(state, connection_id);

        let capacity = self.capacity;
        let channel = state
            .boards
            .entry(board_id)
            .or_insert_with(|| BoardChannel::new(capacity));
        channel.subscribers.insert(connection_id);
        let receiver = channel.sender.subscribe();
        state.connections.insert(connection_id, board_id);

        log::debug!("Connection {connection_id} subscribed to board {board_id}");

        Subscription {
            board_id,
            connection_id,
            receiver,
            stats: self.stats.clone(),
        }
    }

    /// Drop a connection's subscription. Returns the board it was on.
    pub async fn unsubscribe(&self, connection_id: ConnectionId) -> Option<BoardId> {
        let mut state = self.state.write().await;
        let board_id = Self::detach(&mut state, connection_id);
        if let Some(board_id) = board_id {
            log::debug!("Connection {connection_id} unsubscribed from board {board_id}");
        }
        board_id
    }

    fn detach(state: &mut RouterState, connection_id: ConnectionId) -> Option<BoardId> {
        let board_id = state.connections.remove(&connection_id)?;
        let now_empty = match state.boards.get_mut(&board_id) {
            Some(channel) => {
                channel.subscribers.remove(&connection_id);
                channel.subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.boards.remove(&board_id);
        }
        Some(board_id)
    }

    /// Deliver an event to all current subscribers of its board.
    ///
    /// Never waits on a subscriber. Returns the number of receivers the
    /// event was queued for.
    pub async fn publish(&self, event: CommitEvent) -> usize {
        let event = Arc::new(event);
        let delivered = {
            let state = self.state.read().await;
            match state.boards.get(&event.board_id) {
                Some(channel) => channel.sender.send(event).unwrap_or(0),
                None => 0,
            }
        };
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub async fn subscriber_count(&self, board_id: BoardId) -> usize {
        self.state
            .read()
            .await
            .boards
            .get(&board_id)
            .map_or(0, |c| c.subscribers.len())
    }

    pub async fn is_subscribed(&self, connection_id: ConnectionId) -> bool {
        self.state.read().await.connections.contains_key(&connection_id)
    }

    /// Number of boards with at least one subscriber.
    pub async fn board_count(&self) -> usize {
        self.state.read().await.boards.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> BroadcastStats {
        let state = self.state.read().await;
        BroadcastStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            lag_incidents: self.stats.lag_incidents.load(Ordering::Relaxed),
            active_subscribers: state.connections.len(),
            active_boards: state.boards.len(),
        }
    }
}

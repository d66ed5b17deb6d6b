//! One-shot catch-up for a connection joining (or rejoining) a board.
//!
//! ```text
//!   begin()                 finish()                     next_event()
//!     │ subscribe             │ snapshot @ seq N           │ skip seq ≤ N
//!     ▼                       ▼                            ▼
//! ────●───────[e N-1]──[e N]──●────[e N+1]──[e N+2]───────────────► time
//!             buffered by the subscription
//! ```
//!
//! Subscribing before snapshotting means no event published after the
//! snapshot can be missed. Events that were already folded into the
//! snapshot arrive through the subscription too; the [`SnapshotFence`]
//! drops them so nothing is applied twice.

use std::sync::Arc;
use thiserror::Error;

use crate::action::{BoardId, CommitEvent, ConnectionId, Snapshot};
use crate::broadcast::{BroadcastRouter, Subscription, SubscriptionError};
use crate::coordinator::{CoordinatorError, SessionCoordinator};
use crate::protocol::Confirmation;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatchUpError {
    #[error(transparent)]
    Unavailable(#[from] CoordinatorError),
    /// The board was closed between opening and snapshotting.
    #[error("board {0} closed during catch-up")]
    BoardClosed(BoardId),
    /// The board already has as many connections as it accepts.
    #[error("board {0} is full")]
    BoardFull(BoardId),
}

/// Admits only events newer than the snapshot they follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotFence {
    snapshot_seq: u64,
}

impl SnapshotFence {
    pub fn new(snapshot_seq: u64) -> Self {
        Self { snapshot_seq }
    }

    pub fn snapshot_seq(&self) -> u64 {
        self.snapshot_seq
    }

    pub fn admits(&self, event: &CommitEvent) -> bool {
        event.seq > self.snapshot_seq
    }
}

/// Produces catch-up snapshots fenced against the live stream.
#[derive(Clone)]
pub struct CatchUpProducer {
    router: Arc<BroadcastRouter>,
    max_subscribers: usize,
}

impl CatchUpProducer {
    pub fn new(router: Arc<BroadcastRouter>) -> Self {
        Self::with_max_subscribers(router, usize::MAX)
    }

    /// Producer that refuses joiners once a board has `max_subscribers`
    /// connections.
    pub fn with_max_subscribers(router: Arc<BroadcastRouter>, max_subscribers: usize) -> Self {
        Self {
            router,
            max_subscribers,
        }
    }

    /// Subscribe the connection to live events. The snapshot is taken by
    /// [`PendingCatchUp::finish`].
    pub async fn begin(
        &self,
        board_id: BoardId,
        connection_id: ConnectionId,
    ) -> Result<PendingCatchUp, CatchUpError> {
        let subscription = self
            .router
            .subscribe_within(board_id, connection_id, self.max_subscribers)
            .await
            .ok_or(CatchUpError::BoardFull(board_id))?;
        Ok(PendingCatchUp {
            router: self.router.clone(),
            subscription,
        })
    }

    /// `begin` followed by `finish`.
    pub async fn catch_up(
        &self,
        coordinator: &SessionCoordinator,
        board_id: BoardId,
        connection_id: ConnectionId,
    ) -> Result<CatchUp, CatchUpError> {
        self.begin(board_id, connection_id)
            .await?
            .finish(coordinator)
            .await
    }
}

/// A subscribed connection still waiting for its snapshot.
pub struct PendingCatchUp {
    router: Arc<BroadcastRouter>,
    subscription: Subscription,
}

impl PendingCatchUp {
    pub fn board_id(&self) -> BoardId {
        self.subscription.board_id()
    }

    /// Open the board if needed and take the snapshot, along with the
    /// connection's own recent commits. On failure the connection is
    /// unsubscribed again.
    pub async fn finish(self, coordinator: &SessionCoordinator) -> Result<CatchUp, CatchUpError> {
        let board_id = self.subscription.board_id();
        let connection_id = self.subscription.connection_id();

        let snapshot = match coordinator.open_board(board_id).await {
            Ok(()) => coordinator
                .snapshot_for(board_id, connection_id)
                .await
                .map_err(|_| CatchUpError::BoardClosed(board_id)),
            Err(e) => Err(e.into()),
        };

        match snapshot {
            Ok((snapshot, confirmed)) => {
                log::debug!(
                    "Catch-up for {connection_id} on board {board_id} at seq {} ({} actions)",
                    snapshot.seq,
                    snapshot.actions.len()
                );
                Ok(CatchUp {
                    fence: SnapshotFence::new(snapshot.seq),
                    snapshot,
                    confirmed,
                    subscription: self.subscription,
                })
            }
            Err(e) => {
                self.router.unsubscribe(connection_id).await;
                Err(e)
            }
        }
    }
}

/// A snapshot plus the live stream that continues it.
pub struct CatchUp {
    pub snapshot: Snapshot,
    /// Commits this connection made that are already in the snapshot.
    pub confirmed: Vec<Confirmation>,
    pub subscription: Subscription,
    pub fence: SnapshotFence,
}

impl CatchUp {
    /// Next live event not already reflected in the snapshot.
    ///
    /// Cancel-safe: dropping the future loses no admitted event.
    pub async fn next_event(&mut self) -> Result<Arc<CommitEvent>, SubscriptionError> {
        loop {
            let event = self.subscription.recv().await?;
            if self.fence.admits(&event) {
                return Ok(event);
            }
            log::trace!(
                "Fenced out event {} (snapshot at {})",
                event.seq,
                self.fence.snapshot_seq()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionPayload, LogEvent, Point, StrokePayload};
    use crate::action_log::RedoPolicy;
    use crate::auth::AllowAll;
    use crate::coordinator::Participant;
    use crate::storage::MemoryStore;
    use uuid::Uuid;

    fn setup() -> (SessionCoordinator, CatchUpProducer) {
        let router = Arc::new(BroadcastRouter::new(64));
        let coordinator = SessionCoordinator::new(
            router.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(AllowAll),
            RedoPolicy::default(),
        );
        (coordinator, CatchUpProducer::new(router))
    }

    fn stroke() -> ActionPayload {
        ActionPayload::Stroke(StrokePayload {
            points: vec![Point::new(1.0, 1.0), Point::new(2.0, 2.0)],
            color: "#0a0".into(),
            width: 1.0,
        })
    }

    #[test]
    fn test_fence_admits_only_newer() {
        let fence = SnapshotFence::new(5);
        let event = |seq| CommitEvent {
            board_id: Uuid::nil(),
            seq,
            event: LogEvent::Undone(1),
            origin: None,
        };
        assert!(!fence.admits(&event(4)));
        assert!(!fence.admits(&event(5)));
        assert!(fence.admits(&event(6)));
    }

    #[tokio::test]
    async fn test_catch_up_opens_board() {
        let (coordinator, producer) = setup();
        let board = Uuid::new_v4();

        let catch_up = producer.catch_up(&coordinator, board, Uuid::new_v4()).await.unwrap();
        assert_eq!(catch_up.snapshot.seq, 0);
        assert!(coordinator.is_open(board).await);
    }

    #[tokio::test]
    async fn test_commit_during_snapshot_is_not_duplicated() {
        let (coordinator, producer) = setup();
        let board = Uuid::new_v4();
        coordinator.open_board(board).await.unwrap();
        let alice = Participant::new("alice");
        coordinator.submit_payload(board, &alice, None, stroke()).await.unwrap();

        // Commit lands after subscribing but before the snapshot.
        let pending = producer.begin(board, Uuid::new_v4()).await.unwrap();
        coordinator.submit_payload(board, &alice, None, stroke()).await.unwrap();
        let mut catch_up = pending.finish(&coordinator).await.unwrap();

        assert_eq!(catch_up.snapshot.action_ids(), vec![1, 2]);
        assert_eq!(catch_up.fence.snapshot_seq(), 2);

        // Only the next commit gets through the fence.
        coordinator.submit_payload(board, &alice, None, stroke()).await.unwrap();
        let next = catch_up.next_event().await.unwrap();
        assert_eq!(next.seq, 3);
        assert_eq!(next.event.action_id(), 3);
    }

    #[tokio::test]
    async fn test_failed_catch_up_unsubscribes() {
        let router = Arc::new(BroadcastRouter::new(8));
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let coordinator = SessionCoordinator::new(
            router.clone(),
            store,
            Arc::new(AllowAll),
            RedoPolicy::default(),
        );
        let producer = CatchUpProducer::new(router.clone());
        let conn = Uuid::new_v4();

        let err = producer
            .catch_up(&coordinator, Uuid::new_v4(), conn)
            .await
            .err();
        assert!(matches!(err, Some(CatchUpError::Unavailable(_))));
        assert!(!router.is_subscribed(conn).await);
    }

    #[tokio::test]
    async fn test_resync_carries_own_confirmations() {
        let (coordinator, producer) = setup();
        let board = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let first = producer.catch_up(&coordinator, board, conn).await.unwrap();
        assert!(first.confirmed.is_empty());

        let alice = Participant::new("alice").on_connection(conn);
        coordinator.submit_payload(board, &alice, Some("t1".into()), stroke()).await.unwrap();
        let bob = Participant::new("bob").on_connection(Uuid::new_v4());
        coordinator.submit_payload(board, &bob, Some("t1".into()), stroke()).await.unwrap();

        // The connection lost its live stream and asks again.
        let again = producer.catch_up(&coordinator, board, conn).await.unwrap();
        assert_eq!(again.snapshot.seq, 2);
        assert_eq!(
            again.confirmed,
            vec![Confirmation {
                client_temp_id: "t1".into(),
                id: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_full_board_refuses_new_connection() {
        let router = Arc::new(BroadcastRouter::new(8));
        let coordinator = SessionCoordinator::new(
            router.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(AllowAll),
            RedoPolicy::default(),
        );
        let producer = CatchUpProducer::with_max_subscribers(router.clone(), 1);
        let board = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        producer.catch_up(&coordinator, board, first).await.unwrap();
        let err = producer.catch_up(&coordinator, board, second).await.err();
        assert_eq!(err, Some(CatchUpError::BoardFull(board)));
        assert!(!router.is_subscribed(second).await);

        // A resync from the connection already on the board still succeeds.
        assert!(producer.catch_up(&coordinator, board, first).await.is_ok());
    }
}

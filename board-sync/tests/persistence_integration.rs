//! Persistence integration tests.
//!
//! Verifies:
//! - Boards survive a coordinator restart on the same RocksDB directory
//! - Undo and redo history is rebuilt, not just the active picture
//! - Boards stay isolated on disk
//! - A storage failure after open rejects mutations and leaves the log intact

use board_sync::action::{ActionPayload, Point, StrokePayload, TextPayload};
use board_sync::action_log::RedoPolicy;
use board_sync::auth::AllowAll;
use board_sync::broadcast::BroadcastRouter;
use board_sync::catchup::CatchUpProducer;
use board_sync::coordinator::{Participant, SessionCoordinator};
use board_sync::protocol::RejectReason;
use board_sync::storage::{ActionStore, MemoryStore, RocksStore, StoreConfig};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

fn coordinator(store: Arc<dyn ActionStore>) -> SessionCoordinator {
    SessionCoordinator::new(
        Arc::new(BroadcastRouter::new(64)),
        store,
        Arc::new(AllowAll),
        RedoPolicy::ClearOnCommit,
    )
}

fn open_store(dir: &TempDir) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("boards"))).unwrap())
}

fn stroke(x: f64) -> ActionPayload {
    ActionPayload::Stroke(StrokePayload {
        points: vec![Point::new(x, x), Point::new(x + 1.0, x + 1.0)],
        color: "#ff0000".into(),
        width: 3.0,
    })
}

#[tokio::test]
async fn test_board_survives_restart() {
    let dir = TempDir::new().unwrap();
    let board = Uuid::new_v4();
    let alice = Participant::new("alice");

    let before = {
        let store = open_store(&dir);
        let coordinator = coordinator(store.clone());
        coordinator.open_board(board).await.unwrap();

        coordinator.submit_payload(board, &alice, None, stroke(1.0)).await.unwrap();
        coordinator.submit_payload(board, &alice, None, stroke(2.0)).await.unwrap();
        coordinator.clear(board, &alice).await.unwrap();
        coordinator
            .submit_payload(
                board,
                &alice,
                None,
                ActionPayload::Text(TextPayload {
                    text: "hello".into(),
                    x: Some(4.0),
                    y: Some(8.0),
                    attachment: None,
                }),
            )
            .await
            .unwrap();
        coordinator.undo(board, &alice).await.unwrap();
        store.sync().unwrap();
        coordinator.snapshot(board).await.unwrap()
    };

    let store = open_store(&dir);
    let coordinator = coordinator(store);
    coordinator.open_board(board).await.unwrap();
    let after = coordinator.snapshot(board).await.unwrap();

    assert_eq!(after, before);
    assert_eq!(after.seq, 5);
    assert_eq!(after.action_ids(), vec![1, 2, 3]);

    // The undone text is still on the redo stack after the restart.
    let redo = coordinator.redo(board, &alice).await.unwrap();
    assert_eq!((redo.id, redo.seq), (4, 6));

    // Ids continue where the stored log stopped.
    let next = coordinator
        .submit_payload(board, &alice, None, stroke(9.0))
        .await
        .unwrap();
    assert_eq!((next.id, next.seq), (5, 7));
}

#[tokio::test]
async fn test_boards_isolated_on_disk() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let coordinator = coordinator(store.clone());
    let alice = Participant::new("alice");
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    coordinator.open_board(a).await.unwrap();
    coordinator.open_board(b).await.unwrap();
    for i in 0..3 {
        coordinator.submit_payload(a, &alice, None, stroke(i as f64)).await.unwrap();
    }
    coordinator.submit_payload(b, &alice, None, stroke(0.0)).await.unwrap();

    assert_eq!(store.load_all(a).unwrap().len(), 3);
    assert_eq!(store.load_all(b).unwrap().len(), 1);
    assert_eq!(store.load_metadata(a).unwrap().last_seq, 3);

    let mut boards = store.list_boards().unwrap();
    boards.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(boards, expected);
}

#[tokio::test]
async fn test_rejoin_after_eviction_replays_storage() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let router = Arc::new(BroadcastRouter::new(64));
    let coordinator = SessionCoordinator::new(
        router.clone(),
        store,
        Arc::new(AllowAll),
        RedoPolicy::ClearOnCommit,
    );
    let producer = CatchUpProducer::new(router.clone());
    let board = Uuid::new_v4();
    let alice = Participant::new("alice");

    let first = Uuid::new_v4();
    producer.catch_up(&coordinator, board, first).await.unwrap();
    coordinator.submit_payload(board, &alice, None, stroke(1.0)).await.unwrap();
    coordinator.submit_payload(board, &alice, None, stroke(2.0)).await.unwrap();

    router.unsubscribe(first).await;
    assert!(coordinator.evict_if_idle(board).await);
    assert!(!coordinator.is_open(board).await);
    assert_eq!(
        coordinator.submit_payload(board, &alice, None, stroke(3.0)).await,
        Err(RejectReason::UnknownBoard)
    );

    let catch_up = producer
        .catch_up(&coordinator, board, Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(catch_up.snapshot.seq, 2);
    assert_eq!(catch_up.snapshot.action_ids(), vec![1, 2]);
}

#[tokio::test]
async fn test_storage_outage_after_open_rejects_mutations() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = coordinator(store.clone());
    let board = Uuid::new_v4();
    let alice = Participant::new("alice");

    coordinator.open_board(board).await.unwrap();
    coordinator.submit_payload(board, &alice, None, stroke(1.0)).await.unwrap();

    store.set_offline(true);
    assert_eq!(
        coordinator.submit_payload(board, &alice, None, stroke(2.0)).await,
        Err(RejectReason::StorageUnavailable)
    );
    assert_eq!(coordinator.snapshot(board).await.unwrap().action_ids(), vec![1]);
    assert_eq!(coordinator.stats().await.persist_failures, 1);

    // A board that was never loaded cannot be opened while storage is down.
    assert!(coordinator.open_board(Uuid::new_v4()).await.is_err());

    // After recovery, eviction and reload agree with what was accepted.
    store.set_offline(false);
    let commit = coordinator
        .submit_payload(board, &alice, None, stroke(3.0))
        .await
        .unwrap();
    assert_eq!(commit.id, 2);
    assert!(coordinator.evict_if_idle(board).await);
    coordinator.open_board(board).await.unwrap();
    let snapshot = coordinator.snapshot(board).await.unwrap();
    assert_eq!(snapshot.action_ids(), vec![1, 2]);
    assert_eq!(snapshot.actions[1].payload, stroke(3.0));
    assert_eq!(snapshot.seq, 2);
}

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use board_sync::action::{ActionPayload, CommitEvent, LogEvent, Point, StrokePayload};
use board_sync::action_log::{ActionLog, RedoPolicy};
use board_sync::broadcast::BroadcastRouter;
use board_sync::protocol::{ClientMessage, ServerMessage};
use board_sync::replica::ClientReplica;
use uuid::Uuid;

fn stroke(points: usize) -> ActionPayload {
    ActionPayload::Stroke(StrokePayload {
        points: (0..points)
            .map(|i| Point::new(i as f64, (i * 2) as f64))
            .collect(),
        color: "#1e90ff".into(),
        width: 2.5,
    })
}

fn filled_log(actions: usize) -> ActionLog {
    let mut log = ActionLog::with_policy(Uuid::new_v4(), RedoPolicy::ClearOnCommit);
    for i in 0..actions {
        log.append("alice", stroke(32), i as u64);
    }
    log
}

fn bench_log_append(c: &mut Criterion) {
    let board = Uuid::new_v4();
    let payload = stroke(32);

    c.bench_function("log_append_1k", |b| {
        b.iter(|| {
            let mut log = ActionLog::new(board);
            for i in 0..1000u64 {
                black_box(log.append("alice", payload.clone(), i));
            }
        })
    });
}

fn bench_log_snapshot(c: &mut Criterion) {
    let mut log = filled_log(1000);
    for _ in 0..100 {
        if let Some(id) = log.last_undoable() {
            log.mark_undone(id).unwrap();
        }
    }

    c.bench_function("log_snapshot_1k", |b| {
        b.iter(|| black_box(log.snapshot()))
    });
}

fn bench_log_replay(c: &mut Criterion) {
    let board = Uuid::new_v4();
    let mut log = ActionLog::new(board);
    let events: Vec<LogEvent> = (0..1000u64)
        .map(|i| LogEvent::Committed(log.append("alice", stroke(32), i)))
        .collect();

    c.bench_function("log_replay_1k", |b| {
        b.iter(|| black_box(ActionLog::replay(board, RedoPolicy::default(), &events).unwrap()))
    });
}

fn bench_commit_encode(c: &mut Criterion) {
    let mut log = filled_log(0);
    let action = log.append("alice", stroke(64), 0);
    let event = CommitEvent {
        board_id: action.board_id,
        seq: log.seq(),
        event: LogEvent::Committed(action),
        origin: None,
    };
    let recipient = Uuid::new_v4();

    c.bench_function("commit_encode_64pt", |b| {
        b.iter(|| {
            let message = ServerMessage::from_commit(black_box(&event), recipient);
            black_box(message.encode().unwrap())
        })
    });
}

fn bench_submit_decode(c: &mut Criterion) {
    let text = ClientMessage::submit(&stroke(64), "t1").encode().unwrap();

    c.bench_function("submit_decode_64pt", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&text)).unwrap()))
    });
}

fn bench_snapshot_install(c: &mut Criterion) {
    let log = filled_log(1000);
    let init = ServerMessage::init_state(&log.snapshot(), Vec::new());

    c.bench_function("replica_install_1k", |b| {
        b.iter(|| {
            let mut replica = ClientReplica::new(log.board_id());
            replica.connecting();
            replica.connected();
            black_box(replica.handle(init.clone()))
        })
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let router = BroadcastRouter::new(1024);
    let board = Uuid::new_v4();
    let mut subscriptions: Vec<_> = rt.block_on(async {
        let mut subs = Vec::new();
        for _ in 0..100 {
            subs.push(router.subscribe(board, Uuid::new_v4()).await);
        }
        subs
    });
    let mut log = filled_log(0);

    c.bench_function("broadcast_100_subscribers", |b| {
        b.iter(|| {
            let action = log.append("alice", stroke(8), 0);
            let event = CommitEvent {
                board_id: board,
                seq: log.seq(),
                event: LogEvent::Committed(action),
                origin: None,
            };
            black_box(rt.block_on(router.publish(event)));
            for sub in subscriptions.iter_mut() {
                black_box(sub.try_recv().unwrap());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_log_append,
    bench_log_snapshot,
    bench_log_replay,
    bench_commit_encode,
    bench_submit_decode,
    bench_snapshot_install,
    bench_broadcast_fanout,
);
criterion_main!(benches);

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use server::admin::{AdminCommand, BoardDescription};
use server::authz::{AllowAll, AuthorizationError, Authorizer};
use server::config::Config;
use server::gateway::{spawn_gateway, GatewayCommand, GatewayTx};
use server::outbox::{Delivery, Outbox};
use server::outbox::CloseCause;
use server::snapshot_store::{
    MemorySnapshotStore, PersistenceError, SnapshotPersistence, StoredSnapshot,
};
use system::serde_json::json;
use system::{
    ActionRequest, Attributes, BoardDocument, BoardId, ClientMessage, ClientReplicaDocument,
    ConnectionId, ErrorKind, ObjectKind, ObjectReadable, RejectReason, Seq, ServerMessage,
    Snapshot, SnapshotBlob, SnapshotMeta, SnapshotVersion,
};

const WAIT: Duration = Duration::from_secs(5);

struct DenyAll;

#[async_trait]
impl Authorizer for DenyAll {
    async fn can_access(&self, _user_id: &str, _board_id: BoardId) -> Result<bool, AuthorizationError> {
        Ok(false)
    }
}

/// Memory store whose next loads or listings fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemorySnapshotStore,
    failing_loads: AtomicU32,
    failing_lists: AtomicU32,
}

fn injected_failure(counter: &AtomicU32) -> Result<(), PersistenceError> {
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(_) => Err(PersistenceError::Unavailable("injected failure".into())),
        Err(_) => Ok(()),
    }
}

#[async_trait]
impl SnapshotPersistence for FlakyStore {
    async fn save(
        &self,
        board_id: BoardId,
        blob: SnapshotBlob,
        version: SnapshotVersion,
        is_auto: bool,
    ) -> Result<SnapshotMeta, PersistenceError> {
        self.inner.save(board_id, blob, version, is_auto).await
    }

    async fn load(
        &self,
        board_id: BoardId,
        version: SnapshotVersion,
    ) -> Result<Option<Snapshot>, PersistenceError> {
        injected_failure(&self.failing_loads)?;
        self.inner.load(board_id, version).await
    }

    async fn list(&self, board_id: BoardId) -> Result<Vec<StoredSnapshot>, PersistenceError> {
        injected_failure(&self.failing_lists)?;
        self.inner.list(board_id).await
    }

    async fn prune(
        &self,
        board_id: BoardId,
        keep_count: usize,
    ) -> Result<Vec<SnapshotVersion>, PersistenceError> {
        self.inner.prune(board_id, keep_count).await
    }
}

/// A board with `count` rectangles, at seq `count`.
fn board_blob(board_id: BoardId, count: usize) -> SnapshotBlob {
    let mut document = BoardDocument::new(board_id);
    for index in 0..count {
        let create = ActionRequest::Created {
            temp_id: system::uuid::Uuid::new_v4(),
            kind: ObjectKind::Rect,
            attributes: Some(fill(&format!("gray{}", index))),
        };
        document.submit(create, 0, "seed").unwrap();
    }
    SnapshotBlob::encode(&document.capture()).unwrap()
}

fn unreadable_blob(seq: Seq) -> SnapshotBlob {
    let bytes = system::bincode::serialize(&(seq, vec![0xffu8; 3])).unwrap();
    system::bincode::deserialize(&bytes).unwrap()
}

fn config() -> Config {
    Config {
        room_eviction_grace_secs: 60,
        persistence_backoff_ms: 1,
        ..Config::default()
    }
}

fn start(config: Config) -> (GatewayTx, Arc<MemorySnapshotStore>) {
    let store = Arc::new(MemorySnapshotStore::new());
    let gateway = spawn_gateway(config, store.clone(), Arc::new(AllowAll));
    (gateway, store)
}

fn fill(color: &str) -> Attributes {
    Attributes::new(json!({ "fill": color }))
}

async fn connect(gateway: &GatewayTx, connection_id: ConnectionId, user_id: &str) -> Arc<Outbox> {
    let tx = Outbox::new(64);
    gateway
        .send(GatewayCommand::Connect {
            connection_id,
            user_id: user_id.to_owned(),
            tx: tx.clone(),
        })
        .await
        .unwrap();
    tx
}

async fn join_again(gateway: &GatewayTx, connection_id: ConnectionId, board_id: BoardId) {
    send(
        gateway,
        connection_id,
        ClientMessage::JoinBoard {
            board_id,
            last_seq: None,
        },
    )
    .await;
}

async fn describe(gateway: &GatewayTx, board_id: BoardId) -> BoardDescription {
    let (reply_tx, reply_rx) = oneshot::channel();
    gateway
        .send(GatewayCommand::Admin(AdminCommand::DescribeBoard {
            board_id,
            tx: reply_tx,
        }))
        .await
        .unwrap();
    timeout(WAIT, reply_rx).await.unwrap().unwrap().unwrap()
}

async fn send(gateway: &GatewayTx, connection_id: ConnectionId, message: ClientMessage) {
    gateway
        .send(GatewayCommand::Message {
            connection_id,
            message,
        })
        .await
        .unwrap();
}

/// Next message that is not a presence or cursor update.
async fn next(tx: &Outbox) -> ServerMessage {
    loop {
        match timeout(WAIT, tx.recv()).await.expect("no message in time") {
            Delivery::Message(message) if message.is_critical() => return message,
            Delivery::Message(_) => continue,
            Delivery::Closed(cause) => panic!("outbox closed: {:?}", cause),
        }
    }
}

async fn join(
    gateway: &GatewayTx,
    connection_id: ConnectionId,
    user_id: &str,
    board_id: BoardId,
) -> (Arc<Outbox>, ClientReplicaDocument) {
    let tx = connect(gateway, connection_id, user_id).await;
    send(
        gateway,
        connection_id,
        ClientMessage::JoinBoard {
            board_id,
            last_seq: None,
        },
    )
    .await;
    let joined = next(&tx).await;
    let replica = ClientReplicaDocument::from_joined(user_id, joined, Duration::from_secs(1))
        .expect("board-joined expected");
    (tx, replica)
}

fn apply(replica: &mut ClientReplicaDocument, event: ServerMessage) {
    replica.handle_event(event, Instant::now()).unwrap();
}

#[tokio::test]
async fn two_members_converge_through_the_room() {
    let (gateway, _) = start(config());
    let board_id = system::uuid::Uuid::new_v4();
    let (alice_tx, mut alice) = join(&gateway, 1, "alice", board_id).await;
    let (bob_tx, mut bob) = join(&gateway, 2, "bob", board_id).await;

    // alice recolors her rect before the create is acknowledged
    let (temp_id, create) = alice.create(ObjectKind::Rect, fill("red"));
    let recolor = alice.modify(temp_id, fill("purple"));
    send(&gateway, 1, create).await;
    send(&gateway, 1, recolor).await;

    let ack = next(&alice_tx).await;
    let object_id = match &ack {
        ServerMessage::ActionProcessed {
            seq: 1,
            object_id,
            temp_id: Some(acked),
            ..
        } if *acked == temp_id => *object_id,
        other => panic!("unexpected {:?}", other),
    };
    apply(&mut alice, ack);
    apply(&mut alice, next(&alice_tx).await);
    apply(&mut bob, next(&bob_tx).await);
    apply(&mut bob, next(&bob_tx).await);
    assert_eq!(bob.get_attributes(&object_id), Some(&fill("purple")));

    send(&gateway, 2, bob.modify(object_id, fill("blue"))).await;
    apply(&mut bob, next(&bob_tx).await);
    apply(&mut alice, next(&alice_tx).await);

    assert_eq!(alice.seq(), 3);
    assert_eq!(bob.seq(), 3);
    assert_eq!(alice.get_attributes(&object_id), Some(&fill("blue")));
    assert_eq!(alice.live_set(), bob.live_set());
    assert_eq!(alice.pending_len(), 0);
}

#[tokio::test]
async fn actions_before_join_are_refused() {
    let (gateway, _) = start(config());
    let tx = connect(&gateway, 1, "alice").await;
    send(
        &gateway,
        1,
        ClientMessage::CanvasAction {
            board_id: system::uuid::Uuid::new_v4(),
            action: ActionRequest::Removed {
                object_id: Some(system::uuid::Uuid::new_v4()),
            },
        },
    )
    .await;
    assert!(matches!(
        next(&tx).await,
        ServerMessage::Error {
            kind: ErrorKind::NotJoined,
            ..
        }
    ));
    assert!(!tx.is_closed());
}

#[tokio::test]
async fn unauthorized_joins_keep_the_connection() {
    let store = Arc::new(MemorySnapshotStore::new());
    let gateway = spawn_gateway(config(), store, Arc::new(DenyAll));
    let board_id = system::uuid::Uuid::new_v4();
    let tx = connect(&gateway, 1, "mallory").await;
    send(
        &gateway,
        1,
        ClientMessage::JoinBoard {
            board_id,
            last_seq: None,
        },
    )
    .await;
    assert!(matches!(
        next(&tx).await,
        ServerMessage::Error {
            kind: ErrorKind::Unauthorized,
            ..
        }
    ));
    send(&gateway, 1, ClientMessage::RequestResync { board_id }).await;
    assert!(matches!(
        next(&tx).await,
        ServerMessage::Error {
            kind: ErrorKind::NotJoined,
            ..
        }
    ));
}

#[tokio::test]
async fn edits_of_removed_objects_are_rejected() {
    let (gateway, _) = start(config());
    let board_id = system::uuid::Uuid::new_v4();
    let (tx, mut alice) = join(&gateway, 1, "alice", board_id).await;

    let (temp_id, create) = alice.create(ObjectKind::Ellipse, fill("red"));
    send(&gateway, 1, create).await;
    apply(&mut alice, next(&tx).await);
    let object_id = alice.durable_id(&temp_id).unwrap();

    send(&gateway, 1, alice.remove(object_id)).await;
    apply(&mut alice, next(&tx).await);
    send(&gateway, 1, alice.modify(object_id, fill("green"))).await;
    let rejected = next(&tx).await;
    assert_eq!(
        rejected,
        ServerMessage::ActionRejected {
            board_id,
            object_id: Some(object_id),
            reason: RejectReason::StaleReference,
        }
    );
    apply(&mut alice, rejected);
    assert!(!alice.is_live(&object_id));
    assert_eq!(alice.seq(), 2);
}

#[tokio::test]
async fn a_retried_create_is_sequenced_once() {
    let (gateway, _) = start(config());
    let board_id = system::uuid::Uuid::new_v4();
    let (alice_tx, mut alice) = join(&gateway, 1, "alice", board_id).await;
    let (bob_tx, _) = join(&gateway, 2, "bob", board_id).await;

    let (_, create) = alice.create(ObjectKind::Text, fill("black"));
    send(&gateway, 1, create.clone()).await;
    send(&gateway, 1, create).await;
    let (_, other) = alice.create(ObjectKind::Line, fill("black"));
    send(&gateway, 1, other).await;

    let seqs = [next(&alice_tx).await, next(&alice_tx).await, next(&alice_tx).await]
        .iter()
        .map(|ack| match ack {
            ServerMessage::ActionProcessed { seq, .. } => *seq,
            other => panic!("unexpected {:?}", other),
        })
        .collect::<Vec<_>>();
    assert_eq!(seqs, vec![1, 1, 2]);

    for expected in 1..=2 {
        match next(&bob_tx).await {
            ServerMessage::CanvasUpdate { action, .. } => assert_eq!(action.seq, expected),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn a_reconnecting_client_resumes_from_its_last_seq() {
    let (gateway, _) = start(config());
    let board_id = system::uuid::Uuid::new_v4();
    let (tx, mut alice) = join(&gateway, 1, "alice", board_id).await;
    for color in ["red", "green", "blue"] {
        let (_, create) = alice.create(ObjectKind::Rect, fill(color));
        send(&gateway, 1, create).await;
        next(&tx).await;
    }
    gateway
        .send(GatewayCommand::Disconnect { connection_id: 1 })
        .await
        .unwrap();

    let resumed_tx = connect(&gateway, 2, "alice").await;
    send(
        &gateway,
        2,
        ClientMessage::JoinBoard {
            board_id,
            last_seq: Some(1),
        },
    )
    .await;
    match next(&resumed_tx).await {
        ServerMessage::BoardResumed { actions, .. } => {
            assert_eq!(actions.iter().map(|a| a.seq).collect::<Vec<_>>(), vec![2, 3]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn cursor_moves_reach_the_other_members() {
    let (gateway, _) = start(config());
    let board_id = system::uuid::Uuid::new_v4();
    let (_alice_tx, _) = join(&gateway, 1, "alice", board_id).await;
    let (bob_tx, _) = join(&gateway, 2, "bob", board_id).await;

    send(&gateway, 1, ClientMessage::CursorMove { board_id, x: 3.0, y: 4.0 }).await;
    let cursor = loop {
        match timeout(WAIT, bob_tx.recv()).await.unwrap() {
            Delivery::Message(ServerMessage::CursorUpdate { user_id, x, y, .. }) => break (user_id, x, y),
            Delivery::Message(_) => continue,
            Delivery::Closed(cause) => panic!("outbox closed: {:?}", cause),
        }
    };
    assert_eq!(cursor, ("alice".to_owned(), 3.0, 4.0));
}

#[tokio::test]
async fn an_idle_room_is_snapshotted_and_reloaded() {
    let (gateway, store) = start(Config {
        room_eviction_grace_secs: 0,
        ..config()
    });
    let board_id = system::uuid::Uuid::new_v4();
    let (tx, mut alice) = join(&gateway, 1, "alice", board_id).await;
    let (_, create) = alice.create(ObjectKind::Image, fill("none"));
    send(&gateway, 1, create).await;
    next(&tx).await;
    send(&gateway, 1, ClientMessage::LeaveBoard { board_id }).await;

    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(snapshot) = store.latest(board_id).await.unwrap() {
            assert_eq!(snapshot.meta.seq, 1);
            assert!(snapshot.meta.is_auto);
            break;
        }
        assert!(Instant::now() < deadline, "room was never snapshotted");
        sleep(Duration::from_millis(10)).await;
    }

    let (_, bob) = join(&gateway, 2, "bob", board_id).await;
    assert_eq!(bob.seq(), 1);
    assert_eq!(bob.live_set().len(), 1);
}

#[tokio::test]
async fn manual_snapshots_survive_failed_writes() {
    let (gateway, store) = start(config());
    let board_id = system::uuid::Uuid::new_v4();
    let (tx, mut alice) = join(&gateway, 1, "alice", board_id).await;
    let (_, create) = alice.create(ObjectKind::Path, fill("teal"));
    send(&gateway, 1, create).await;
    next(&tx).await;

    store.fail_saves(2);
    let (reply_tx, reply_rx) = oneshot::channel();
    gateway
        .send(GatewayCommand::Admin(AdminCommand::TakeSnapshot {
            board_id,
            tx: reply_tx,
        }))
        .await
        .unwrap();
    let meta = timeout(WAIT, reply_rx).await.unwrap().unwrap().unwrap();
    assert_eq!(meta.seq, 1);
    assert!(!meta.is_auto);

    match describe(&gateway, board_id).await {
        BoardDescription::Online(description) => {
            assert_eq!(description.seq, 1);
            assert_eq!(description.object_count, 1);
            assert_eq!(description.members.len(), 1);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn boards_without_a_room_are_described_from_the_store() {
    let (gateway, _) = start(config());
    let (reply_tx, reply_rx) = oneshot::channel();
    gateway
        .send(GatewayCommand::Admin(AdminCommand::DescribeBoard {
            board_id: system::uuid::Uuid::new_v4(),
            tx: reply_tx,
        }))
        .await
        .unwrap();
    match timeout(WAIT, reply_rx).await.unwrap().unwrap().unwrap() {
        BoardDescription::Offline { snapshots, .. } => assert!(snapshots.is_empty()),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn a_board_survives_failed_loads() {
    let store = Arc::new(FlakyStore::default());
    let board_id = system::uuid::Uuid::new_v4();
    store.save(board_id, board_blob(board_id, 3), 1, true).await.unwrap();
    store.failing_lists.store(1, Ordering::SeqCst);
    store.failing_loads.store(2, Ordering::SeqCst);
    let gateway = spawn_gateway(config(), store.clone(), Arc::new(AllowAll));

    let (tx, mut alice) = join(&gateway, 1, "alice", board_id).await;
    assert_eq!(alice.seq(), 3);
    assert_eq!(alice.live_set().len(), 3);

    let (_, create) = alice.create(ObjectKind::Rect, fill("red"));
    send(&gateway, 1, create).await;
    match next(&tx).await {
        ServerMessage::ActionProcessed { seq, .. } => assert_eq!(seq, 4),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn a_corrupt_snapshot_falls_back_to_an_older_one() {
    let (gateway, store) = start(config());
    let board_id = system::uuid::Uuid::new_v4();
    store.save(board_id, board_blob(board_id, 3), 1, true).await.unwrap();
    store.save(board_id, unreadable_blob(5), 2, true).await.unwrap();

    let (_, alice) = join(&gateway, 1, "alice", board_id).await;
    assert_eq!(alice.seq(), 3);
    assert_eq!(alice.live_set().len(), 3);

    // new snapshots never overwrite the unreadable one
    let (reply_tx, reply_rx) = oneshot::channel();
    gateway
        .send(GatewayCommand::Admin(AdminCommand::TakeSnapshot {
            board_id,
            tx: reply_tx,
        }))
        .await
        .unwrap();
    let meta = timeout(WAIT, reply_rx).await.unwrap().unwrap().unwrap();
    assert_eq!(meta.version, 3);
    assert_eq!(meta.seq, 3);
}

#[tokio::test]
async fn an_unreadable_board_turns_joiners_away_until_repaired() {
    let (gateway, store) = start(config());
    let board_id = system::uuid::Uuid::new_v4();
    store.save(board_id, unreadable_blob(3), 1, true).await.unwrap();

    let tx = connect(&gateway, 1, "alice").await;
    join_again(&gateway, 1, board_id).await;
    assert!(matches!(
        next(&tx).await,
        ServerMessage::Error {
            kind: ErrorKind::Unavailable,
            ..
        }
    ));
    send(
        &gateway,
        1,
        ClientMessage::CanvasAction {
            board_id,
            action: ActionRequest::Removed {
                object_id: Some(system::uuid::Uuid::new_v4()),
            },
        },
    )
    .await;
    assert!(matches!(
        next(&tx).await,
        ServerMessage::Error {
            kind: ErrorKind::NotJoined,
            ..
        }
    ));
    assert_eq!(
        store.list(board_id).await.unwrap(),
        vec![StoredSnapshot {
            version: 1,
            is_auto: true
        }]
    );

    // the stopped room is replaced by a fresh one on the next join
    store.save(board_id, board_blob(board_id, 2), 2, false).await.unwrap();
    join_again(&gateway, 1, board_id).await;
    match next(&tx).await {
        ServerMessage::BoardJoined {
            seq_at_capture,
            view,
            ..
        } => {
            assert_eq!(seq_at_capture, 2);
            assert_eq!(view.objects.len(), 2);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn members_coming_and_going_from_a_busy_room_stay_in_order() {
    let (gateway, _) = start(Config {
        room_queue_capacity: 1,
        ..config()
    });
    let board_id = system::uuid::Uuid::new_v4();
    let (alice_tx, mut alice) = join(&gateway, 1, "alice", board_id).await;
    let bob_tx = connect(&gateway, 2, "bob").await;

    let mut creates = 0;
    for _ in 0..3 {
        for color in ["red", "green"] {
            let (_, create) = alice.create(ObjectKind::Rect, fill(color));
            send(&gateway, 1, create).await;
            creates += 1;
        }
        join_again(&gateway, 2, board_id).await;
        match next(&bob_tx).await {
            ServerMessage::BoardJoined { .. } => {
                send(&gateway, 2, ClientMessage::LeaveBoard { board_id }).await;
            }
            ServerMessage::Error {
                kind: ErrorKind::Overloaded,
                ..
            } => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    // every create is answered, sequenced or turned away
    for _ in 0..creates {
        match next(&alice_tx).await {
            ServerMessage::ActionProcessed { .. } => {}
            ServerMessage::ActionRejected {
                reason: RejectReason::Overloaded,
                ..
            } => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    let deadline = Instant::now() + WAIT;
    loop {
        join_again(&gateway, 2, board_id).await;
        match next(&bob_tx).await {
            ServerMessage::BoardJoined { .. } => break,
            ServerMessage::Error {
                kind: ErrorKind::Overloaded,
                ..
            } => assert!(Instant::now() < deadline, "bob never got back in"),
            other => panic!("unexpected {:?}", other),
        }
        sleep(Duration::from_millis(10)).await;
    }
    match describe(&gateway, board_id).await {
        BoardDescription::Online(description) => assert_eq!(description.members.len(), 2),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn a_resume_past_the_retained_actions_gets_the_whole_board() {
    let (gateway, _) = start(Config {
        action_log_retention: 2,
        ..config()
    });
    let board_id = system::uuid::Uuid::new_v4();
    let (tx, mut alice) = join(&gateway, 1, "alice", board_id).await;
    for _ in 0..5 {
        let (_, create) = alice.create(ObjectKind::Ellipse, fill("red"));
        send(&gateway, 1, create).await;
        apply(&mut alice, next(&tx).await);
    }

    let resumed_tx = connect(&gateway, 2, "alice").await;
    send(
        &gateway,
        2,
        ClientMessage::JoinBoard {
            board_id,
            last_seq: Some(1),
        },
    )
    .await;
    match next(&resumed_tx).await {
        ServerMessage::BoardJoined {
            seq_at_capture,
            view,
            ..
        } => {
            assert_eq!(seq_at_capture, 5);
            assert_eq!(view.objects.len(), 5);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn automatic_snapshots_are_pruned_and_manual_ones_kept() {
    let (gateway, store) = start(Config {
        snapshot_action_threshold: 2,
        snapshot_interval_secs: 3600,
        snapshot_keep_count: 1,
        ..config()
    });
    let board_id = system::uuid::Uuid::new_v4();
    let (tx, mut alice) = join(&gateway, 1, "alice", board_id).await;
    for create in create_two(&mut alice) {
        send(&gateway, 1, create).await;
        next(&tx).await;
    }
    let deadline = Instant::now() + WAIT;
    while store.list(board_id).await.unwrap().is_empty() {
        assert!(Instant::now() < deadline, "threshold snapshot never written");
        sleep(Duration::from_millis(10)).await;
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    gateway
        .send(GatewayCommand::Admin(AdminCommand::TakeSnapshot {
            board_id,
            tx: reply_tx,
        }))
        .await
        .unwrap();
    let manual = timeout(WAIT, reply_rx).await.unwrap().unwrap().unwrap();
    assert_eq!(manual.version, 2);

    for create in create_two(&mut alice) {
        send(&gateway, 1, create).await;
        next(&tx).await;
    }
    let expected = vec![
        StoredSnapshot {
            version: 2,
            is_auto: false,
        },
        StoredSnapshot {
            version: 3,
            is_auto: true,
        },
    ];
    let deadline = Instant::now() + WAIT;
    while store.list(board_id).await.unwrap() != expected {
        assert!(Instant::now() < deadline, "snapshots were not pruned");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn a_member_that_falls_behind_is_dropped() {
    let (gateway, _) = start(config());
    let board_id = system::uuid::Uuid::new_v4();
    let (alice_tx, mut alice) = join(&gateway, 1, "alice", board_id).await;

    // bob never reads, so his outbox overflows
    let bob_tx = Outbox::new(2);
    gateway
        .send(GatewayCommand::Connect {
            connection_id: 2,
            user_id: "bob".to_owned(),
            tx: bob_tx.clone(),
        })
        .await
        .unwrap();
    join_again(&gateway, 2, board_id).await;
    wait_for_members(&alice_tx, 2).await;

    for color in ["red", "green", "blue"] {
        let (_, create) = alice.create(ObjectKind::Rect, fill(color));
        send(&gateway, 1, create).await;
    }
    wait_for_members(&alice_tx, 1).await;
    assert_eq!(
        timeout(WAIT, bob_tx.recv()).await.unwrap(),
        Delivery::Closed(CloseCause::Overflow)
    );

    // the gateway learns from the room that bob is gone
    send(
        &gateway,
        2,
        ClientMessage::CanvasAction {
            board_id,
            action: ActionRequest::Created {
                temp_id: system::uuid::Uuid::new_v4(),
                kind: ObjectKind::Rect,
                attributes: Some(fill("black")),
            },
        },
    )
    .await;
    let deadline = Instant::now() + WAIT;
    loop {
        let (reply_tx, reply_rx) = oneshot::channel();
        gateway
            .send(GatewayCommand::Admin(AdminCommand::ListBoards { tx: reply_tx }))
            .await
            .unwrap();
        let boards = timeout(WAIT, reply_rx).await.unwrap().unwrap();
        if boards.len() == 1 && boards[0].sessions == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "bob still counted as joined");
        sleep(Duration::from_millis(10)).await;
    }
}

fn create_two(replica: &mut ClientReplicaDocument) -> [ClientMessage; 2] {
    [
        replica.create(ObjectKind::Rect, fill("red")).1,
        replica.create(ObjectKind::Rect, fill("blue")).1,
    ]
}

/// Reads until a presence update lists `count` members.
async fn wait_for_members(tx: &Outbox, count: usize) {
    loop {
        match timeout(WAIT, tx.recv()).await.expect("no presence in time") {
            Delivery::Message(ServerMessage::PresenceChanged { members, .. }) if members.len() == count => {
                return
            }
            Delivery::Message(_) => continue,
            Delivery::Closed(cause) => panic!("outbox closed: {:?}", cause),
        }
    }
}

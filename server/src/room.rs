use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit, Receiver, Sender, WeakSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use system::{
    ActionLog, ActionRequest, BoardDocument, BoardId, BoardState, ConnectionId, Member,
    ObjectId, Seq, ServerMessage, SnapshotMeta, SnapshotSchedule, SnapshotVersion,
};

use crate::config::Config;
use crate::gateway::{send_or_spawn, GatewayCommand, GatewayTx};
use crate::session::Session;
use crate::snapshot_store::{PersistenceError, SnapshotPersistence};
use crate::snapshot_writer::{retry, write_snapshot, RetryPolicy};

const MAX_SNAPSHOT_CHECK_PERIOD: Duration = Duration::from_secs(1);
const MIN_SNAPSHOT_CHECK_PERIOD: Duration = Duration::from_millis(10);

pub type SnapshotReply = oneshot::Sender<Result<SnapshotMeta, PersistenceError>>;

#[derive(Debug)]
pub enum RoomCommand {
    Join {
        session: Session,
        last_seq: Option<Seq>,
    },
    Leave {
        connection_id: ConnectionId,
    },
    Submit {
        connection_id: ConnectionId,
        request: ActionRequest,
    },
    CursorMove {
        connection_id: ConnectionId,
        x: f32,
        y: f32,
    },
    Resync {
        connection_id: ConnectionId,
    },
    Describe {
        tx: oneshot::Sender<RoomDescription>,
    },
    TakeSnapshot {
        tx: SnapshotReply,
    },
    SnapshotWritten {
        meta: Option<SnapshotMeta>,
    },
}

pub type RoomTx = Sender<RoomCommand>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDescription {
    pub board_id: BoardId,
    pub seq: Seq,
    pub members: Vec<Member>,
    pub object_count: usize,
    pub tombstone_count: usize,
    pub retained_actions: usize,
    pub latest_snapshot_version: Option<SnapshotVersion>,
    pub pending_snapshot_writes: usize,
}

/// The gateway's end of a room. Dropping it retires the room.
///
/// Commands that must not be lost wait in `backlog` while the room queue is
/// full, and everything sent after them waits too, so the room sees
/// commands in the order the gateway issued them.
pub struct RoomHandle {
    board_id: BoardId,
    pub generation: u64,
    tx: RoomTx,
    backlog: VecDeque<RoomCommand>,
    backlog_capacity: usize,
    awaiting_space: bool,
    gateway_tx: GatewayTx,
    pub join_handle: JoinHandle<()>,
}

#[derive(Debug)]
pub enum Refused {
    /// The room is behind; nothing was queued.
    Busy(RoomCommand),
    /// The room task is gone.
    Closed(RoomCommand),
}

/// What loading a board found in the store.
struct Loaded {
    state: BoardState,
    version: Option<SnapshotVersion>,
    next_version: SnapshotVersion,
}

/// Newest readable snapshot of the board. Snapshots that do not decode are
/// skipped for older ones; store failures are retried. Fails rather than
/// start empty when snapshots exist but none can be read.
async fn load_latest(
    store: &dyn SnapshotPersistence,
    board_id: BoardId,
    policy: RetryPolicy,
) -> Result<Loaded, PersistenceError> {
    let what = format!("listing snapshots of board {}", board_id);
    let stored = retry(policy, &what, || store.list(board_id)).await?;
    let next_version = stored.last().map_or(1, |newest| newest.version + 1);

    for candidate in stored.iter().rev() {
        let what = format!("loading snapshot {} of board {}", candidate.version, board_id);
        let decoded = match retry(policy, &what, || store.load(board_id, candidate.version)).await {
            Ok(Some(snapshot)) => snapshot.blob.decode().map_err(PersistenceError::from),
            Ok(None) => continue,
            Err(error) if !error.is_transient() => Err(error),
            Err(error) => return Err(error),
        };
        match decoded {
            Ok(state) => {
                return Ok(Loaded {
                    state,
                    version: Some(candidate.version),
                    next_version,
                })
            }
            Err(error) => log::warn!(
                "Snapshot {} of board {} is unreadable, trying an older one: {}",
                candidate.version,
                board_id,
                error
            ),
        }
    }

    if stored.is_empty() {
        Ok(Loaded {
            state: BoardState::default(),
            version: None,
            next_version,
        })
    } else {
        Err(PersistenceError::Unavailable(format!(
            "none of the {} snapshots of board {} is readable",
            stored.len(),
            board_id
        )))
    }
}

/// Single writer of one board: sequences its actions and fans them out.
struct Room {
    document: BoardDocument,
    log: ActionLog,
    members: BTreeMap<ConnectionId, Session>,
    schedule: SnapshotSchedule,
    latest_snapshot_version: Option<SnapshotVersion>,
    next_snapshot_version: SnapshotVersion,
    snapshot_writes: Vec<JoinHandle<()>>,
    store: Arc<dyn SnapshotPersistence>,
    gateway_tx: GatewayTx,
    room_tx: WeakSender<RoomCommand>,
    generation: u64,
    config: Config,
}

impl Room {
    async fn load(
        board_id: BoardId,
        store: Arc<dyn SnapshotPersistence>,
        gateway_tx: GatewayTx,
        room_tx: WeakSender<RoomCommand>,
        generation: u64,
        config: Config,
    ) -> Result<Self, PersistenceError> {
        let loaded = load_latest(store.as_ref(), board_id, config.retry_policy()).await?;
        let seq = loaded.state.seq;
        log::info!(
            "Room {} opened at seq {} (snapshot {:?})",
            board_id,
            seq,
            loaded.version
        );

        Ok(Self {
            document: BoardDocument::from_state(board_id, loaded.state),
            log: ActionLog::new(config.action_log_retention, seq),
            members: BTreeMap::new(),
            schedule: SnapshotSchedule::new(
                config.snapshot_action_threshold,
                config.snapshot_interval(),
                Instant::now(),
            ),
            latest_snapshot_version: loaded.version,
            next_snapshot_version: loaded.next_version,
            snapshot_writes: Vec::new(),
            store,
            gateway_tx,
            room_tx,
            generation,
            config,
        })
    }

    fn board_id(&self) -> BoardId {
        self.document.board_id()
    }

    fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join { session, last_seq } => self.join(session, last_seq),
            RoomCommand::Leave { connection_id } => {
                if self.members.remove(&connection_id).is_some() {
                    self.broadcast_presence();
                }
            }
            RoomCommand::Submit {
                connection_id,
                request,
            } => self.submit(connection_id, request),
            RoomCommand::CursorMove {
                connection_id,
                x,
                y,
            } => {
                if let Some(session) = self.members.get(&connection_id) {
                    let update = ServerMessage::CursorUpdate {
                        board_id: self.board_id(),
                        connection_id,
                        user_id: session.user_id.clone(),
                        x,
                        y,
                    };
                    self.broadcast(update, Some(connection_id));
                }
            }
            RoomCommand::Resync { connection_id } => {
                let joined = self.joined_message(connection_id);
                self.send_to(connection_id, joined);
            }
            RoomCommand::Describe { tx } => {
                self.snapshot_writes.retain(|write| !write.is_finished());
                let description = RoomDescription {
                    board_id: self.board_id(),
                    seq: self.document.seq(),
                    members: self.members(),
                    object_count: self.document.object_count(),
                    tombstone_count: self.document.tombstone_count(),
                    retained_actions: self.log.len(),
                    latest_snapshot_version: self.latest_snapshot_version,
                    pending_snapshot_writes: self.snapshot_writes.len(),
                };
                let _ = tx.send(description);
            }
            RoomCommand::TakeSnapshot { tx } => self.take_snapshot(false, Some(tx)),
            RoomCommand::SnapshotWritten { meta } => {
                if let Some(meta) = meta {
                    self.latest_snapshot_version = self.latest_snapshot_version.max(Some(meta.version));
                    if meta.is_auto {
                        self.prune();
                    }
                }
            }
        }
    }

    fn join(&mut self, session: Session, last_seq: Option<Seq>) {
        let connection_id = session.connection_id;
        let board_id = self.board_id();
        self.members.insert(connection_id, session);
        let reply = match last_seq.and_then(|last_seq| self.log.since(last_seq)) {
            Some(actions) => {
                log::info!(
                    "Connection {} resumed board {} with {} actions",
                    connection_id,
                    board_id,
                    actions.len()
                );
                ServerMessage::BoardResumed { board_id, actions }
            }
            None => {
                log::info!(
                    "Connection {} joined board {} at seq {}",
                    connection_id,
                    board_id,
                    self.document.seq()
                );
                self.joined_message(connection_id)
            }
        };
        self.send_to(connection_id, reply);
        self.broadcast_presence();
    }

    fn joined_message(&self, connection_id: ConnectionId) -> ServerMessage {
        ServerMessage::BoardJoined {
            board_id: self.board_id(),
            connection_id,
            view: self.document.view(self.latest_snapshot_version.unwrap_or(0)),
            seq_at_capture: self.document.seq(),
            members: self.members(),
        }
    }

    fn submit(&mut self, connection_id: ConnectionId, request: ActionRequest) {
        let board_id = self.board_id();
        let user_id = match self.members.get(&connection_id) {
            Some(session) => session.user_id.clone(),
            None => {
                log::warn!(
                    "Refusing {} action from connection {}, not a member of board {}",
                    request.name(),
                    connection_id,
                    board_id
                );
                send_or_spawn(
                    &self.gateway_tx,
                    GatewayCommand::NotMember {
                        connection_id,
                        board_id,
                        request,
                    },
                );
                return;
            }
        };
        let temp_id = request.temp_id();

        if let Some(temp_id) = temp_id {
            if let Some(original) = self.log.find_by_temp_id(&temp_id) {
                log::debug!("Create {} already sequenced at {}", temp_id, original.seq);
                let ack = ServerMessage::ActionProcessed {
                    board_id,
                    seq: original.seq,
                    object_id: original.action.object_id(),
                    temp_id: Some(temp_id),
                };
                let object_id = original.action.object_id();
                self.send_to(connection_id, ack);
                self.acknowledge_create(connection_id, temp_id, object_id);
                return;
            }
        }

        let reference = request.reference();
        match self.document.submit(request, connection_id, &user_id) {
            Ok(sequenced) => {
                log::debug!("Board {} sequenced {:?}", board_id, sequenced);
                if let Err(error) = self.log.append(sequenced.clone()) {
                    log::error!("Action log of board {} out of step: {}", board_id, error);
                }
                let object_id = sequenced.action.object_id();
                self.send_to(
                    connection_id,
                    ServerMessage::ActionProcessed {
                        board_id,
                        seq: sequenced.seq,
                        object_id,
                        temp_id,
                    },
                );
                self.broadcast(
                    ServerMessage::CanvasUpdate {
                        board_id,
                        action: sequenced,
                    },
                    Some(connection_id),
                );
                if let Some(temp_id) = temp_id {
                    self.acknowledge_create(connection_id, temp_id, object_id);
                }
                self.schedule.record_action();
                if self.schedule.is_due(Instant::now()) {
                    self.take_snapshot(true, None);
                }
            }
            Err(error) => {
                log::warn!(
                    "Rejected action from connection {} on board {}: {}",
                    connection_id,
                    board_id,
                    error
                );
                self.send_to(
                    connection_id,
                    ServerMessage::ActionRejected {
                        board_id,
                        object_id: reference,
                        reason: error.reject_reason(),
                    },
                );
                if let Some(temp_id) = temp_id {
                    send_or_spawn(
                        &self.gateway_tx,
                        GatewayCommand::CreateRejected {
                            connection_id,
                            board_id,
                            temp_id,
                        },
                    );
                }
            }
        }
    }

    fn acknowledge_create(&self, connection_id: ConnectionId, temp_id: ObjectId, object_id: ObjectId) {
        send_or_spawn(
            &self.gateway_tx,
            GatewayCommand::CreateAcknowledged {
                connection_id,
                board_id: self.board_id(),
                temp_id,
                object_id,
            },
        );
    }

    fn members(&self) -> Vec<Member> {
        self.members.values().map(Session::member).collect()
    }

    fn send_to(&mut self, connection_id: ConnectionId, message: ServerMessage) {
        let delivered = match self.members.get(&connection_id) {
            Some(session) => session.send(message),
            None => return,
        };
        if !delivered {
            self.drop_member(connection_id);
        }
    }

    fn broadcast(&mut self, message: ServerMessage, without: Option<ConnectionId>) {
        let mut closed = Vec::new();
        for (connection_id, session) in &self.members {
            if Some(*connection_id) != without && !session.send(message.clone()) {
                closed.push(*connection_id);
            }
        }
        for connection_id in closed {
            self.drop_member(connection_id);
        }
    }

    fn broadcast_presence(&mut self) {
        let presence = ServerMessage::PresenceChanged {
            board_id: self.board_id(),
            members: self.members(),
        };
        self.broadcast(presence, None);
    }

    /// The connection's outbox is closed; the gateway will follow up with a
    /// `Leave` once the socket is gone.
    fn drop_member(&mut self, connection_id: ConnectionId) {
        if self.members.remove(&connection_id).is_some() {
            log::info!(
                "Connection {} dropped from board {} (outbox closed)",
                connection_id,
                self.board_id()
            );
            self.broadcast_presence();
        }
    }

    fn take_snapshot(&mut self, is_auto: bool, reply: Option<SnapshotReply>) {
        let state = self.document.capture();
        let version = self.next_snapshot_version;
        self.next_snapshot_version += 1;
        self.schedule.mark_taken(Instant::now());

        let board_id = self.board_id();
        let store = self.store.clone();
        let room_tx = self.room_tx.clone();
        let policy = self.config.retry_policy();
        let write = tokio::spawn(async move {
            let result = write_snapshot(store.as_ref(), board_id, state, version, is_auto, policy).await;
            if let Some(room_tx) = room_tx.upgrade() {
                let meta = result.as_ref().ok().cloned();
                let _ = room_tx.send(RoomCommand::SnapshotWritten { meta }).await;
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        });
        self.snapshot_writes.retain(|write| !write.is_finished());
        self.snapshot_writes.push(write);
    }

    fn prune(&self) {
        let board_id = self.board_id();
        let store = self.store.clone();
        let keep_count = self.config.snapshot_keep_count;
        tokio::spawn(async move {
            match store.prune(board_id, keep_count).await {
                Ok(pruned) if !pruned.is_empty() => {
                    log::debug!("Pruned snapshots {:?} of board {}", pruned, board_id)
                }
                Ok(_) => {}
                Err(error) => log::warn!("Pruning snapshots of board {} failed: {}", board_id, error),
            }
        });
    }

    async fn retire(mut self) {
        let board_id = self.board_id();
        if self.schedule.actions_since() > 0 {
            self.take_snapshot(true, None);
        }
        for write in self.snapshot_writes.drain(..) {
            if let Err(error) = write.await {
                log::error!("Snapshot task of board {} failed: {}", board_id, error);
            }
        }
        if let Err(error) = self.store.prune(board_id, self.config.snapshot_keep_count).await {
            log::warn!("Pruning snapshots of board {} failed: {}", board_id, error);
        }
        log::info!("Room {} retired at seq {}", board_id, self.document.seq());
        send_or_spawn(
            &self.gateway_tx,
            GatewayCommand::RoomRetired {
                board_id,
                generation: self.generation,
            },
        );
    }
}

async fn run_room(mut room: Room, mut rx: Receiver<RoomCommand>) {
    let period = room
        .config
        .snapshot_interval()
        .clamp(MIN_SNAPSHOT_CHECK_PERIOD, MAX_SNAPSHOT_CHECK_PERIOD);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => room.handle_command(command),
                // the gateway dropped its handle
                None => break,
            },
            _ = ticker.tick() => {
                if room.schedule.is_due(Instant::now()) {
                    room.take_snapshot(true, None);
                }
            }
        }
    }
    room.retire().await;
}

/// A board that could not be loaded takes no commands; the gateway is told
/// so it can turn its members away.
async fn refuse_board(
    board_id: BoardId,
    generation: u64,
    error: PersistenceError,
    gateway_tx: GatewayTx,
    mut rx: Receiver<RoomCommand>,
) {
    log::error!("Board {} could not be loaded: {}", board_id, error);
    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let RoomCommand::TakeSnapshot { tx } = command {
            let _ = tx.send(Err(PersistenceError::Unavailable(error.to_string())));
        }
    }
    send_or_spawn(
        &gateway_tx,
        GatewayCommand::RoomFailed {
            board_id,
            generation,
        },
    );
}

/// Starts the task owning `board_id`. When `predecessor` is given (an older
/// room of the same board still retiring) the new room waits for it before
/// loading the latest snapshot.
pub fn spawn_room(
    board_id: BoardId,
    generation: u64,
    store: Arc<dyn SnapshotPersistence>,
    gateway_tx: GatewayTx,
    config: Config,
    predecessor: Option<JoinHandle<()>>,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel::<RoomCommand>(config.room_queue_capacity);
    let room_tx = tx.downgrade();
    let backlog_capacity = config.room_queue_capacity;
    let handle_gateway_tx = gateway_tx.clone();
    let join_handle = tokio::spawn(async move {
        if let Some(predecessor) = predecessor {
            if let Err(error) = predecessor.await {
                log::error!("Previous room of board {} failed: {}", board_id, error);
            }
        }
        let loaded = Room::load(
            board_id,
            store,
            gateway_tx.clone(),
            room_tx,
            generation,
            config,
        )
        .await;
        match loaded {
            Ok(room) => run_room(room, rx).await,
            Err(error) => refuse_board(board_id, generation, error, gateway_tx, rx).await,
        }
    });
    RoomHandle {
        board_id,
        generation,
        tx,
        backlog: VecDeque::new(),
        backlog_capacity,
        awaiting_space: false,
        gateway_tx: handle_gateway_tx,
        join_handle,
    }
}

impl RoomHandle {
    pub fn tx(&self) -> &RoomTx {
        &self.tx
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// For commands that must arrive, in order. A full queue parks the
    /// command in the backlog; only `Leave` is parked past the backlog's
    /// capacity.
    pub fn send(&mut self, command: RoomCommand) -> Result<(), Refused> {
        if !self.backlog.is_empty() {
            let must_park = matches!(command, RoomCommand::Leave { .. });
            if self.backlog.len() >= self.backlog_capacity && !must_park {
                return Err(Refused::Busy(command));
            }
            self.backlog.push_back(command);
            return Ok(());
        }
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(command)) => {
                self.backlog.push_back(command);
                self.wait_for_space();
                Ok(())
            }
            Err(TrySendError::Closed(command)) => Err(Refused::Closed(command)),
        }
    }

    /// For commands that may be turned away when the room is behind.
    pub fn offer(&mut self, command: RoomCommand) -> Result<(), Refused> {
        if !self.backlog.is_empty() {
            return Err(Refused::Busy(command));
        }
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(command)) => Err(Refused::Busy(command)),
            Err(TrySendError::Closed(command)) => Err(Refused::Closed(command)),
        }
    }

    /// Moves the backlog into the room queue, starting with the slot that
    /// `permit` reserved.
    pub fn flush(&mut self, permit: OwnedPermit<RoomCommand>) {
        self.awaiting_space = false;
        match self.backlog.pop_front() {
            Some(command) => {
                permit.send(command);
            }
            None => return,
        }
        while let Some(command) = self.backlog.pop_front() {
            match self.tx.try_send(command) {
                Ok(()) => {}
                Err(TrySendError::Full(command)) => {
                    self.backlog.push_front(command);
                    self.wait_for_space();
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    self.backlog.clear();
                    return;
                }
            }
        }
    }

    fn wait_for_space(&mut self) {
        if self.awaiting_space {
            return;
        }
        self.awaiting_space = true;
        let tx = self.tx.clone();
        let gateway_tx = self.gateway_tx.clone();
        let board_id = self.board_id;
        let generation = self.generation;
        log::debug!("Room {} is full, holding commands back", board_id);
        tokio::spawn(async move {
            if let Ok(permit) = tx.reserve_owned().await {
                let space = GatewayCommand::RoomSpace {
                    board_id,
                    generation,
                    permit,
                };
                if gateway_tx.send(space).await.is_err() {
                    log::warn!("Gateway closed while room {} had a backlog", board_id);
                }
            }
        });
    }
}

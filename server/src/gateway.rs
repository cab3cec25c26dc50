use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{channel, error::TrySendError, OwnedPermit, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use system::{
    ActionRequest, BoardId, ClientMessage, ConnectionId, ErrorKind, ObjectId, RejectReason,
    Routed, Seq, ServerMessage, UserId,
};

use crate::admin::{AdminCommand, AdminError, BoardDescription, BoardSummary};
use crate::authz::Authorizer;
use crate::config::Config;
use crate::connection_tx_storage::{ConnectionTx, ConnectionTxStorage};
use crate::room::{spawn_room, Refused, RoomCommand, RoomHandle};
use crate::server_state::{ConnectionState, ServerState};
use crate::session::Session;
use crate::snapshot_store::SnapshotPersistence;

#[derive(Debug)]
pub enum GatewayCommand {
    Connect {
        connection_id: ConnectionId,
        user_id: UserId,
        tx: ConnectionTx,
    },
    Disconnect {
        connection_id: ConnectionId,
    },
    Message {
        connection_id: ConnectionId,
        message: ClientMessage,
    },
    /// Authorization verdict for a pending join.
    Admitted {
        connection_id: ConnectionId,
        board_id: BoardId,
        last_seq: Option<Seq>,
        allowed: bool,
    },
    CreateAcknowledged {
        connection_id: ConnectionId,
        board_id: BoardId,
        temp_id: ObjectId,
        object_id: ObjectId,
    },
    CreateRejected {
        connection_id: ConnectionId,
        board_id: BoardId,
        temp_id: ObjectId,
    },
    /// The room turned down an action from a connection it does not count
    /// as a member.
    NotMember {
        connection_id: ConnectionId,
        board_id: BoardId,
        request: ActionRequest,
    },
    EvictIfIdle {
        board_id: BoardId,
    },
    /// A slot in the room queue for the oldest held-back command.
    RoomSpace {
        board_id: BoardId,
        generation: u64,
        permit: OwnedPermit<RoomCommand>,
    },
    RoomRetired {
        board_id: BoardId,
        generation: u64,
    },
    /// The room could not load its board and stopped.
    RoomFailed {
        board_id: BoardId,
        generation: u64,
    },
    Admin(AdminCommand),
}

pub type GatewayTx = Sender<GatewayCommand>;

/// Sends without waiting; when the queue is full the send waits in a spawned
/// task instead.
pub fn send_or_spawn(tx: &GatewayTx, command: GatewayCommand) {
    match tx.try_send(command) {
        Ok(()) => {}
        Err(TrySendError::Full(command)) => {
            let tx = tx.clone();
            tokio::spawn(async move {
                if tx.send(command).await.is_err() {
                    log::warn!("Gateway closed before a queued command was delivered");
                }
            });
        }
        Err(TrySendError::Closed(_)) => log::warn!("Gateway is closed"),
    }
}

struct RetiringRoom {
    generation: u64,
    join_handle: JoinHandle<()>,
}

fn unavailable(board_id: BoardId) -> ServerMessage {
    ServerMessage::error(
        ErrorKind::Unavailable,
        format!("board {} is unavailable, join again", board_id),
    )
}

/// Owns connections, sessions, room handles and reconcilers.
struct Gateway {
    server_state: ServerState,
    connections: ConnectionTxStorage,
    rooms: HashMap<BoardId, RoomHandle>,
    retiring: HashMap<BoardId, RetiringRoom>,
    next_generation: u64,
    store: Arc<dyn SnapshotPersistence>,
    authorizer: Arc<dyn Authorizer>,
    config: Config,
    tx: GatewayTx,
}

impl Gateway {
    fn handle_command(&mut self, command: GatewayCommand) {
        match command {
            GatewayCommand::Connect {
                connection_id,
                user_id,
                tx,
            } => {
                self.server_state.connect(connection_id, user_id.clone());
                self.connections.insert(connection_id, tx);
                log::info!(
                    "Connection {} opened by {} ({} open)",
                    connection_id,
                    user_id,
                    self.connections.len()
                );
            }
            GatewayCommand::Disconnect { connection_id } => {
                if let Some(board_id) = self.server_state.disconnect(&connection_id) {
                    self.detach(connection_id, board_id);
                }
                self.connections.remove(&connection_id);
                log::info!("Connection {} closed", connection_id);
            }
            GatewayCommand::Message {
                connection_id,
                message,
            } => self.handle_message(connection_id, message),
            GatewayCommand::Admitted {
                connection_id,
                board_id,
                last_seq,
                allowed,
            } => self.complete_join(connection_id, board_id, last_seq, allowed),
            GatewayCommand::CreateAcknowledged {
                connection_id,
                board_id,
                temp_id,
                object_id,
            } => {
                if !self.server_state.is_joined_to(&connection_id, &board_id) {
                    return;
                }
                let replay = match self.server_state.reconciler_mut(&connection_id) {
                    Some(reconciler) => reconciler.acknowledge(temp_id, object_id),
                    None => return,
                };
                for request in replay {
                    self.submit(connection_id, board_id, request);
                }
            }
            GatewayCommand::CreateRejected {
                connection_id,
                board_id,
                temp_id,
            } => {
                if !self.server_state.is_joined_to(&connection_id, &board_id) {
                    return;
                }
                self.drop_pending(connection_id, board_id, temp_id);
            }
            GatewayCommand::NotMember {
                connection_id,
                board_id,
                request,
            } => self.not_member(connection_id, board_id, request),
            GatewayCommand::EvictIfIdle { board_id } => self.evict_if_idle(board_id),
            GatewayCommand::RoomSpace {
                board_id,
                generation,
                permit,
            } => {
                // a permit for a room that is gone is simply dropped
                if let Some(room) = self.rooms.get_mut(&board_id) {
                    if room.generation == generation {
                        room.flush(permit);
                    }
                }
            }
            GatewayCommand::RoomRetired {
                board_id,
                generation,
            } => {
                let finished = self
                    .retiring
                    .get(&board_id)
                    .map_or(false, |retiring| retiring.generation == generation);
                if finished {
                    self.retiring.remove(&board_id);
                }
            }
            GatewayCommand::RoomFailed {
                board_id,
                generation,
            } => {
                let current = self
                    .rooms
                    .get(&board_id)
                    .map_or(false, |room| room.generation == generation);
                if current {
                    self.room_failed(board_id);
                }
            }
            GatewayCommand::Admin(command) => self.handle_admin_command(command),
        }
    }

    fn handle_message(&mut self, connection_id: ConnectionId, message: ClientMessage) {
        let state = match self.server_state.state(&connection_id) {
            Some(state) => state,
            None => {
                log::warn!("Message from unknown connection {}", connection_id);
                return;
            }
        };
        log::debug!("Ingress from {}: {:?}", connection_id, message);
        match message {
            ClientMessage::JoinBoard { board_id, last_seq } => {
                let live_room = self
                    .rooms
                    .get(&board_id)
                    .map_or(false, |room| !room.is_closed());
                if state == ConnectionState::Joined(board_id) && live_room {
                    self.enter_room(connection_id, board_id, last_seq);
                } else {
                    self.begin_join(connection_id, board_id, last_seq);
                }
            }
            ClientMessage::LeaveBoard { board_id } => {
                if self.server_state.leave(&connection_id, &board_id).is_ok() {
                    self.detach(connection_id, board_id);
                } else {
                    self.not_joined(connection_id, board_id);
                }
            }
            ClientMessage::CanvasAction { board_id, action } => {
                if state != ConnectionState::Joined(board_id) {
                    self.not_joined(connection_id, board_id);
                    return;
                }
                let routed = match self.server_state.reconciler_mut(&connection_id) {
                    Some(reconciler) => reconciler.route(action),
                    None => return,
                };
                match routed {
                    Routed::Forward(request) => self.submit(connection_id, board_id, request),
                    Routed::Queued => log::debug!(
                        "Connection {} edit queued behind a pending create",
                        connection_id
                    ),
                }
            }
            ClientMessage::CursorMove { board_id, x, y } => {
                if state != ConnectionState::Joined(board_id) {
                    self.not_joined(connection_id, board_id);
                    return;
                }
                let command = RoomCommand::CursorMove {
                    connection_id,
                    x,
                    y,
                };
                // cursor traffic is best-effort
                if let Err(Refused::Closed(_)) = self.offer(board_id, command) {
                    self.room_failed(board_id);
                }
            }
            ClientMessage::RequestResync { board_id } => {
                if state != ConnectionState::Joined(board_id) {
                    self.not_joined(connection_id, board_id);
                    return;
                }
                match self.offer(board_id, RoomCommand::Resync { connection_id }) {
                    Ok(()) => {}
                    Err(Refused::Busy(_)) => self.connections.send(
                        &connection_id,
                        ServerMessage::error(ErrorKind::Overloaded, "board is busy, retry later"),
                    ),
                    Err(Refused::Closed(_)) => self.room_failed(board_id),
                }
            }
        }
    }

    fn offer(&mut self, board_id: BoardId, command: RoomCommand) -> Result<(), Refused> {
        match self.rooms.get_mut(&board_id) {
            Some(room) => room.offer(command),
            None => Err(Refused::Closed(command)),
        }
    }

    fn begin_join(&mut self, connection_id: ConnectionId, board_id: BoardId, last_seq: Option<Seq>) {
        match self.server_state.begin_admission(&connection_id, board_id) {
            Ok(Some(left)) => self.detach(connection_id, left),
            Ok(None) => {}
            Err(error) => {
                log::warn!("Cannot admit connection {}: {:?}", connection_id, error);
                return;
            }
        }
        let user_id = match self.server_state.user_id(&connection_id) {
            Some(user_id) => user_id.clone(),
            None => return,
        };
        let authorizer = self.authorizer.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let allowed = match authorizer.can_access(&user_id, board_id).await {
                Ok(allowed) => allowed,
                Err(error) => {
                    log::error!("Authorization of {} for board {} failed: {}", user_id, board_id, error);
                    false
                }
            };
            let verdict = GatewayCommand::Admitted {
                connection_id,
                board_id,
                last_seq,
                allowed,
            };
            if tx.send(verdict).await.is_err() {
                log::warn!("Gateway closed before admitting connection {}", connection_id);
            }
        });
    }

    fn complete_join(
        &mut self,
        connection_id: ConnectionId,
        board_id: BoardId,
        last_seq: Option<Seq>,
        allowed: bool,
    ) {
        if self.server_state.state(&connection_id) != Some(ConnectionState::Admitting(board_id)) {
            log::debug!("Dropping stale verdict for connection {}", connection_id);
            return;
        }
        if !allowed {
            let _ = self.server_state.deny(&connection_id, board_id);
            log::warn!("Connection {} may not join board {}", connection_id, board_id);
            self.connections.send(
                &connection_id,
                ServerMessage::error(
                    ErrorKind::Unauthorized,
                    format!("no access to board {}", board_id),
                ),
            );
            return;
        }
        if self.rooms.get(&board_id).map_or(false, RoomHandle::is_closed) {
            // a fresh room is started below
            self.room_failed(board_id);
        }
        if self.server_state.admit(&connection_id, board_id).is_err() {
            return;
        }
        self.enter_room(connection_id, board_id, last_seq);
    }

    /// Hands a joined connection's session to the room, starting the room if
    /// needed.
    fn enter_room(&mut self, connection_id: ConnectionId, board_id: BoardId, last_seq: Option<Seq>) {
        let session = match self.session(connection_id, board_id) {
            Some(session) => session,
            None => return,
        };
        let refused = match self.room(board_id).send(RoomCommand::Join { session, last_seq }) {
            Ok(()) => return,
            Err(refused) => refused,
        };
        let _ = self.server_state.leave(&connection_id, &board_id);
        match refused {
            Refused::Busy(_) => {
                log::warn!("Room {} is overloaded, turning connection {} away", board_id, connection_id);
                self.connections.send(
                    &connection_id,
                    ServerMessage::error(
                        ErrorKind::Overloaded,
                        format!("board {} is busy, join again later", board_id),
                    ),
                );
                self.evict_later_if_empty(board_id);
            }
            Refused::Closed(_) => {
                self.room_failed(board_id);
                self.connections.send(&connection_id, unavailable(board_id));
            }
        }
    }

    fn session(&self, connection_id: ConnectionId, board_id: BoardId) -> Option<Session> {
        let user_id = self.server_state.user_id(&connection_id)?.clone();
        let tx = self.connections.get(&connection_id)?.clone();
        Some(Session::new(connection_id, board_id, user_id, tx))
    }

    /// The room of `board_id`, started if needed.
    fn room(&mut self, board_id: BoardId) -> &mut RoomHandle {
        let Gateway {
            rooms,
            retiring,
            next_generation,
            store,
            config,
            tx,
            ..
        } = self;
        rooms.entry(board_id).or_insert_with(|| {
            let predecessor = retiring
                .remove(&board_id)
                .map(|retiring| retiring.join_handle);
            *next_generation += 1;
            spawn_room(
                board_id,
                *next_generation,
                store.clone(),
                tx.clone(),
                config.clone(),
                predecessor,
            )
        })
    }

    /// Drops the handle of a room that stopped on its own and sends its
    /// members back to the lobby. The next join starts a new room.
    fn room_failed(&mut self, board_id: BoardId) {
        if self.rooms.remove(&board_id).is_some() {
            log::error!("Room {} stopped, turning its members away", board_id);
        }
        for connection_id in self.server_state.connection_ids_in_board(&board_id) {
            if self.server_state.leave(&connection_id, &board_id).is_ok() {
                self.connections.send(&connection_id, unavailable(board_id));
            }
        }
    }

    fn submit(&mut self, connection_id: ConnectionId, board_id: BoardId, request: ActionRequest) {
        let command = RoomCommand::Submit {
            connection_id,
            request,
        };
        match self.offer(board_id, command) {
            Ok(()) => {}
            Err(Refused::Busy(RoomCommand::Submit { request, .. })) => {
                log::warn!("Room {} is overloaded, rejecting {}", board_id, request.name());
                if let Some(temp_id) = request.temp_id() {
                    self.drop_pending(connection_id, board_id, temp_id);
                }
                self.reject(connection_id, board_id, &request, RejectReason::Overloaded);
            }
            Err(Refused::Closed(RoomCommand::Submit { request, .. })) => {
                self.reject(connection_id, board_id, &request, RejectReason::NotJoined);
                self.room_failed(board_id);
            }
            Err(_) => {}
        }
    }

    /// Forgets a create that will never be acknowledged; the edits queued
    /// behind it are rejected.
    fn drop_pending(&mut self, connection_id: ConnectionId, board_id: BoardId, temp_id: ObjectId) {
        let dropped = self
            .server_state
            .reconciler_mut(&connection_id)
            .map(|reconciler| reconciler.reject(temp_id))
            .unwrap_or_default();
        for queued in dropped {
            self.reject(connection_id, board_id, &queued, RejectReason::UnknownObject);
        }
    }

    /// The room and the gateway disagree on membership; the room wins and the
    /// connection has to join again.
    fn not_member(&mut self, connection_id: ConnectionId, board_id: BoardId, request: ActionRequest) {
        self.reject(connection_id, board_id, &request, RejectReason::NotJoined);
        if !self.server_state.is_joined_to(&connection_id, &board_id) {
            return;
        }
        if let Some(temp_id) = request.temp_id() {
            self.drop_pending(connection_id, board_id, temp_id);
        }
        log::warn!("Connection {} is missing from room {}", connection_id, board_id);
        let _ = self.server_state.leave(&connection_id, &board_id);
        self.not_joined(connection_id, board_id);
        self.evict_later_if_empty(board_id);
    }

    fn reject(
        &self,
        connection_id: ConnectionId,
        board_id: BoardId,
        request: &ActionRequest,
        reason: RejectReason,
    ) {
        self.connections.send(
            &connection_id,
            ServerMessage::ActionRejected {
                board_id,
                object_id: request.reference(),
                reason,
            },
        );
    }

    fn not_joined(&self, connection_id: ConnectionId, board_id: BoardId) {
        self.connections.send(
            &connection_id,
            ServerMessage::error(
                ErrorKind::NotJoined,
                format!("join board {} first", board_id),
            ),
        );
    }

    /// Takes the connection out of the room; schedules eviction when the board
    /// has nobody left.
    fn detach(&mut self, connection_id: ConnectionId, board_id: BoardId) {
        let sent = self
            .rooms
            .get_mut(&board_id)
            .map(|room| room.send(RoomCommand::Leave { connection_id }));
        if let Some(Err(Refused::Closed(_))) = sent {
            self.room_failed(board_id);
        }
        self.evict_later_if_empty(board_id);
    }

    fn evict_later_if_empty(&self, board_id: BoardId) {
        if !self.server_state.is_board_empty(&board_id) || !self.rooms.contains_key(&board_id) {
            return;
        }
        let grace = self.config.room_eviction_grace();
        let tx = self.tx.clone();
        log::debug!("Board {} is empty, evicting in {:?}", board_id, grace);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(GatewayCommand::EvictIfIdle { board_id }).await;
        });
    }

    fn evict_if_idle(&mut self, board_id: BoardId) {
        if !self.server_state.is_board_empty(&board_id) {
            return;
        }
        if let Some(room) = self.rooms.remove(&board_id) {
            log::info!("Evicting idle room {}", board_id);
            // dropping the handle closes the room queue; the room retires
            // once it has drained it
            let RoomHandle {
                generation,
                join_handle,
                ..
            } = room;
            self.retiring.insert(
                board_id,
                RetiringRoom {
                    generation,
                    join_handle,
                },
            );
        }
    }

    fn handle_admin_command(&mut self, command: AdminCommand) {
        match command {
            AdminCommand::ListBoards { tx } => {
                let mut boards = self
                    .rooms
                    .keys()
                    .map(|board_id| BoardSummary {
                        board_id: *board_id,
                        sessions: self.server_state.connection_ids_in_board(board_id).len(),
                    })
                    .collect::<Vec<_>>();
                boards.sort_by_key(|summary| summary.board_id);
                let _ = tx.send(boards);
            }
            AdminCommand::DescribeBoard { board_id, tx } => match self.rooms.get(&board_id) {
                Some(room) => {
                    let room_tx = room.tx().clone();
                    tokio::spawn(async move {
                        let (describe_tx, describe_rx) = oneshot::channel();
                        let description = match room_tx
                            .send(RoomCommand::Describe { tx: describe_tx })
                            .await
                        {
                            Ok(()) => describe_rx
                                .await
                                .map(BoardDescription::Online)
                                .map_err(|_| AdminError::RoomGone(board_id)),
                            Err(_) => Err(AdminError::RoomGone(board_id)),
                        };
                        let _ = tx.send(description);
                    });
                }
                None => {
                    let store = self.store.clone();
                    tokio::spawn(async move {
                        let description = store
                            .list(board_id)
                            .await
                            .map(|snapshots| BoardDescription::Offline {
                                board_id,
                                snapshots,
                            })
                            .map_err(AdminError::from);
                        let _ = tx.send(description);
                    });
                }
            },
            AdminCommand::TakeSnapshot { board_id, tx } => match self.rooms.get(&board_id) {
                Some(room) => {
                    let room_tx = room.tx().clone();
                    tokio::spawn(async move {
                        let (snapshot_tx, snapshot_rx) = oneshot::channel();
                        let result = match room_tx
                            .send(RoomCommand::TakeSnapshot { tx: snapshot_tx })
                            .await
                        {
                            Ok(()) => match snapshot_rx.await {
                                Ok(written) => written.map_err(AdminError::from),
                                Err(_) => Err(AdminError::RoomGone(board_id)),
                            },
                            Err(_) => Err(AdminError::RoomGone(board_id)),
                        };
                        let _ = tx.send(result);
                    });
                }
                None => {
                    let _ = tx.send(Err(AdminError::BoardOffline(board_id)));
                }
            },
        }
    }
}

async fn run_gateway(mut gateway: Gateway, mut rx: Receiver<GatewayCommand>) {
    while let Some(command) = rx.recv().await {
        gateway.handle_command(command);
    }
}

/// Starts the gateway on the current runtime. Rooms are spawned on the same
/// runtime.
pub fn spawn_gateway(
    config: Config,
    store: Arc<dyn SnapshotPersistence>,
    authorizer: Arc<dyn Authorizer>,
) -> GatewayTx {
    let (tx, rx) = channel::<GatewayCommand>(config.gateway_queue_capacity);
    let gateway = Gateway {
        server_state: ServerState::new(config.alias_capacity),
        connections: ConnectionTxStorage::new(),
        rooms: HashMap::new(),
        retiring: HashMap::new(),
        next_generation: 0,
        store,
        authorizer,
        config,
        tx: tx.clone(),
    };
    tokio::spawn(run_gateway(gateway, rx));
    tx
}

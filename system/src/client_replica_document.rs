use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::action::{ActionError, ActionRequest, SequencedAction};
use crate::board_document::{BoardDocument, BoardState};
use crate::message::{BoardView, ClientMessage, ServerMessage};
use crate::object::{Attributes, CanvasObject, ObjectKind};
use crate::traits::ObjectReadable;
use crate::types::*;

/// A client's copy of a board.
///
/// Server actions are applied strictly in seq order; anything arriving early
/// waits in a buffer. Local edits are shown optimistically on top of the
/// confirmed state until the server acknowledges or rejects them.
pub struct ClientReplicaDocument {
    board_id: BoardId,
    connection_id: ConnectionId,
    user_id: UserId,
    confirmed: BoardDocument,
    pending: VecDeque<ActionRequest>,
    bindings: HashMap<ObjectId, ObjectId>,
    buffered: BTreeMap<Seq, SequencedAction>,
    gap_started_at: Option<Instant>,
    gap_timeout: Duration,
    view: BTreeMap<ObjectId, CanvasObject>,
}

impl ClientReplicaDocument {
    pub fn new(
        board_id: BoardId,
        connection_id: ConnectionId,
        user_id: impl Into<UserId>,
        view: BoardView,
        seq_at_capture: Seq,
        gap_timeout: Duration,
    ) -> Self {
        let mut replica = Self {
            board_id,
            connection_id,
            user_id: user_id.into(),
            confirmed: BoardDocument::new(board_id),
            pending: VecDeque::new(),
            bindings: HashMap::new(),
            buffered: BTreeMap::new(),
            gap_started_at: None,
            gap_timeout,
            view: BTreeMap::new(),
        };
        replica.reset(view, seq_at_capture);
        replica
    }

    /// Builds a replica from a `board-joined` event.
    pub fn from_joined(
        user_id: impl Into<UserId>,
        event: ServerMessage,
        gap_timeout: Duration,
    ) -> Option<Self> {
        match event {
            ServerMessage::BoardJoined {
                board_id,
                connection_id,
                view,
                seq_at_capture,
                ..
            } => Some(Self::new(
                board_id,
                connection_id,
                user_id,
                view,
                seq_at_capture,
                gap_timeout,
            )),
            _ => None,
        }
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    /// Seq of the last server action applied.
    pub fn seq(&self) -> Seq {
        self.confirmed.seq()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn durable_id(&self, temp_id: &ObjectId) -> Option<ObjectId> {
        self.bindings.get(temp_id).copied()
    }

    pub fn create(&mut self, kind: ObjectKind, attributes: Attributes) -> (ObjectId, ClientMessage) {
        let temp_id = uuid::Uuid::new_v4();
        let message = self.push_local(ActionRequest::Created {
            temp_id,
            kind,
            attributes: Some(attributes),
        });
        (temp_id, message)
    }

    pub fn modify(&mut self, object_id: ObjectId, attributes: Attributes) -> ClientMessage {
        let object_id = self.resolve(&object_id);
        self.push_local(ActionRequest::Modified {
            object_id: Some(object_id),
            attributes: Some(attributes),
        })
    }

    pub fn remove(&mut self, object_id: ObjectId) -> ClientMessage {
        let object_id = self.resolve(&object_id);
        self.push_local(ActionRequest::Removed {
            object_id: Some(object_id),
        })
    }

    fn push_local(&mut self, request: ActionRequest) -> ClientMessage {
        self.pending.push_back(request.clone());
        self.rebuild_view();
        ClientMessage::CanvasAction {
            board_id: self.board_id,
            action: request,
        }
    }

    /// Applies a server event; returns the ids whose rendering changed.
    pub fn handle_event(
        &mut self,
        event: ServerMessage,
        now: Instant,
    ) -> Result<HashSet<ObjectId>, ActionError> {
        let invalidated = match event {
            ServerMessage::CanvasUpdate { board_id, action } if board_id == self.board_id => {
                self.receive(action, now)?
            }
            ServerMessage::BoardResumed { board_id, actions } if board_id == self.board_id => {
                let mut invalidated = HashSet::new();
                for action in actions {
                    invalidated.extend(self.receive(action, now)?);
                }
                invalidated
            }
            ServerMessage::ActionProcessed {
                board_id,
                seq,
                object_id,
                temp_id,
            } if board_id == self.board_id => self.acknowledge(seq, object_id, temp_id, now)?,
            ServerMessage::ActionRejected {
                board_id,
                object_id,
                reason,
            } if board_id == self.board_id => {
                log::info!("Local edit of {:?} rejected: {:?}", object_id, reason);
                self.rollback(object_id)
            }
            ServerMessage::BoardJoined {
                board_id,
                connection_id,
                view,
                seq_at_capture,
                ..
            } if board_id == self.board_id => {
                self.connection_id = connection_id;
                self.reset(view, seq_at_capture);
                self.view.keys().copied().collect()
            }
            _ => HashSet::new(),
        };
        self.rebuild_view();
        Ok(invalidated)
    }

    /// Asks for a fresh view once a seq gap has been open for too long.
    pub fn poll_resync(&mut self, now: Instant) -> Option<ClientMessage> {
        let started_at = self.gap_started_at?;
        if now.duration_since(started_at) < self.gap_timeout {
            return None;
        }
        log::warn!(
            "Gap after seq {} not filled within {:?}, requesting resync",
            self.confirmed.seq(),
            self.gap_timeout
        );
        self.gap_started_at = Some(now);
        Some(ClientMessage::RequestResync {
            board_id: self.board_id,
        })
    }

    fn receive(
        &mut self,
        action: SequencedAction,
        now: Instant,
    ) -> Result<HashSet<ObjectId>, ActionError> {
        if action.seq > self.confirmed.seq() {
            self.buffered.insert(action.seq, action);
        }
        self.drain(now)
    }

    fn drain(&mut self, now: Instant) -> Result<HashSet<ObjectId>, ActionError> {
        let mut invalidated = HashSet::new();
        while let Some(next) = self.buffered.remove(&(self.confirmed.seq() + 1)) {
            self.confirmed.apply_sequenced(&next)?;
            invalidated.insert(next.action.object_id());
        }
        let applied = self.confirmed.seq();
        self.buffered.retain(|seq, _| *seq > applied);
        self.gap_started_at = if self.buffered.is_empty() {
            None
        } else {
            self.gap_started_at.or(Some(now))
        };
        Ok(invalidated)
    }

    /// Slots one of our own edits into the total order at `seq`.
    fn acknowledge(
        &mut self,
        seq: Seq,
        object_id: ObjectId,
        temp_id: Option<ObjectId>,
        now: Instant,
    ) -> Result<HashSet<ObjectId>, ActionError> {
        if let Some(temp_id) = temp_id {
            self.bindings.insert(temp_id, object_id);
        }
        let position = match temp_id {
            Some(temp_id) => self
                .pending
                .iter()
                .position(|request| request.temp_id() == Some(temp_id)),
            None => self
                .pending
                .iter()
                .position(|request| request.target().map(|t| self.resolve(&t)) == Some(object_id)),
        };
        let request = match position.and_then(|index| self.pending.remove(index)) {
            Some(request) => request,
            None => {
                log::warn!("Ack for seq {} matches no pending edit", seq);
                return Ok(HashSet::new());
            }
        };

        let mut invalidated = HashSet::new();
        invalidated.extend(temp_id);
        if seq <= self.confirmed.seq() {
            // already part of a view received after a resync
            return Ok(invalidated);
        }
        let action = request.retarget(object_id).into_action(Some(object_id))?;
        invalidated.extend(self.receive(
            SequencedAction {
                seq,
                origin: self.connection_id,
                user_id: self.user_id.clone(),
                temp_id,
                action,
            },
            now,
        )?);
        Ok(invalidated)
    }

    fn rollback(&mut self, object_id: Option<ObjectId>) -> HashSet<ObjectId> {
        let mut invalidated = HashSet::new();
        let object_id = match object_id {
            Some(object_id) => object_id,
            None => return invalidated,
        };
        let position = self
            .pending
            .iter()
            .position(|request| request.reference().map(|r| self.resolve(&r)) == Some(self.resolve(&object_id)));
        if let Some(request) = position.and_then(|index| self.pending.remove(index)) {
            invalidated.insert(object_id);
            if let Some(temp_id) = request.temp_id() {
                self.pending
                    .retain(|dependent| dependent.target() != Some(temp_id));
            }
        }
        invalidated
    }

    fn reset(&mut self, view: BoardView, seq_at_capture: Seq) {
        let objects = view
            .objects
            .into_iter()
            .map(|object| (object.id, object))
            .collect();
        self.confirmed = BoardDocument::from_state(
            self.board_id,
            BoardState {
                seq: seq_at_capture,
                objects: Arc::new(objects),
                tombstones: Arc::default(),
            },
        );
        self.buffered.retain(|seq, _| *seq > seq_at_capture);
        // drain cannot fail here: every buffered action follows the view
        if let Err(error) = self.drain(Instant::now()) {
            log::warn!("Dropping buffered actions after resync: {}", error);
            self.buffered.clear();
            self.gap_started_at = None;
        }
        self.rebuild_view();
    }

    fn resolve(&self, object_id: &ObjectId) -> ObjectId {
        self.bindings.get(object_id).copied().unwrap_or(*object_id)
    }

    fn rebuild_view(&mut self) {
        let mut view = (*self.confirmed.capture().objects).clone();
        for request in &self.pending {
            match request {
                ActionRequest::Created {
                    temp_id,
                    kind,
                    attributes,
                } => {
                    view.insert(
                        *temp_id,
                        CanvasObject {
                            id: *temp_id,
                            kind: *kind,
                            attributes: attributes.clone().unwrap_or_default(),
                            last_modified_by: self.user_id.clone(),
                            last_modified_seq: 0,
                        },
                    );
                }
                ActionRequest::Modified {
                    object_id: Some(object_id),
                    attributes: Some(attributes),
                } => {
                    if let Some(object) = view.get_mut(&self.resolve(object_id)) {
                        object.attributes = attributes.clone();
                    }
                }
                ActionRequest::Removed {
                    object_id: Some(object_id),
                } => {
                    view.remove(&self.resolve(object_id));
                }
                _ => {}
            }
        }
        self.view = view;
    }
}

impl ObjectReadable for ClientReplicaDocument {
    fn get_object(&self, object_id: &ObjectId) -> Option<&CanvasObject> {
        self.view
            .get(object_id)
            .or_else(|| self.view.get(&self.resolve(object_id)))
    }

    fn is_tombstoned(&self, object_id: &ObjectId) -> bool {
        self.confirmed.is_tombstoned(&self.resolve(object_id))
    }

    fn live_objects(&self) -> Box<dyn Iterator<Item = &CanvasObject> + '_> {
        Box::new(self.view.values())
    }
}

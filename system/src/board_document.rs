use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionError, ActionRequest, SequencedAction};
use crate::message::BoardView;
use crate::object::CanvasObject;
use crate::traits::ObjectReadable;
use crate::types::*;

/// Everything needed to rebuild a board at `seq`.
///
/// The maps sit behind `Arc`s: cloning a state is a reference copy and the
/// owning document copies on write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardState {
    pub seq: Seq,
    pub objects: Arc<BTreeMap<ObjectId, CanvasObject>>,
    /// Removed ids and the seq that removed them.
    pub tombstones: Arc<BTreeMap<ObjectId, Seq>>,
}

/// Object model of one board plus its ordering authority.
pub struct BoardDocument {
    board_id: BoardId,
    state: BoardState,
}

impl BoardDocument {
    pub fn new(board_id: BoardId) -> Self {
        Self::from_state(board_id, BoardState::default())
    }

    pub fn from_state(board_id: BoardId, state: BoardState) -> Self {
        log::debug!(
            "BoardDocument {} loaded at seq {} ({} objects)",
            board_id,
            state.seq,
            state.objects.len()
        );
        Self { board_id, state }
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    pub fn seq(&self) -> Seq {
        self.state.seq
    }

    pub fn object_count(&self) -> usize {
        self.state.objects.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.state.tombstones.len()
    }

    /// Immutable copy of the current state, cheap enough to take on every turn.
    pub fn capture(&self) -> BoardState {
        self.state.clone()
    }

    pub fn view(&self, snapshot_version: SnapshotVersion) -> BoardView {
        BoardView {
            snapshot_version,
            objects: self.state.objects.values().cloned().collect(),
        }
    }

    /// Validates a client request, assigns it the next seq and applies it.
    pub fn submit(
        &mut self,
        request: ActionRequest,
        origin: ConnectionId,
        user_id: &str,
    ) -> Result<SequencedAction, ActionError> {
        let temp_id = request.temp_id();
        if let Some(temp_id) = temp_id {
            // a client-chosen id must not name anything the board has seen
            self.check_fresh(&temp_id)?;
        }
        let durable_id = temp_id.map(|_| uuid::Uuid::new_v4());
        let action = request.into_action(durable_id)?;
        self.check(&action)?;

        let sequenced = SequencedAction {
            seq: self.state.seq + 1,
            origin,
            user_id: user_id.to_owned(),
            temp_id,
            action,
        };
        self.mutate(&sequenced);
        Ok(sequenced)
    }

    /// Applies an action that was already sequenced by the board's authority.
    /// Returns `false` when the seq was applied before.
    pub fn apply_sequenced(&mut self, action: &SequencedAction) -> Result<bool, ActionError> {
        if action.seq <= self.state.seq {
            return Ok(false);
        }
        let expected = self.state.seq + 1;
        if action.seq != expected {
            return Err(ActionError::OrderingGap {
                expected,
                got: action.seq,
            });
        }
        self.mutate(action);
        Ok(true)
    }

    fn check_fresh(&self, object_id: &ObjectId) -> Result<(), ActionError> {
        if self.state.tombstones.contains_key(object_id) {
            Err(ActionError::StaleReference(*object_id))
        } else if self.state.objects.contains_key(object_id) {
            Err(ActionError::DuplicateObject(*object_id))
        } else {
            Ok(())
        }
    }

    fn check(&self, action: &Action) -> Result<(), ActionError> {
        let object_id = action.object_id();
        match action {
            Action::Created { .. } => self.check_fresh(&object_id),
            Action::Modified { .. } | Action::Removed { .. } => {
                if self.state.tombstones.contains_key(&object_id) {
                    Err(ActionError::StaleReference(object_id))
                } else if !self.state.objects.contains_key(&object_id) {
                    Err(ActionError::UnknownObject(object_id))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn mutate(&mut self, sequenced: &SequencedAction) {
        self.state.seq = sequenced.seq;
        match &sequenced.action {
            Action::Created {
                object_id,
                kind,
                attributes,
            } => {
                Arc::make_mut(&mut self.state.objects).insert(
                    *object_id,
                    CanvasObject {
                        id: *object_id,
                        kind: *kind,
                        attributes: attributes.clone(),
                        last_modified_by: sequenced.user_id.clone(),
                        last_modified_seq: sequenced.seq,
                    },
                );
            }
            Action::Modified {
                object_id,
                attributes,
            } => {
                if let Some(object) = Arc::make_mut(&mut self.state.objects).get_mut(object_id) {
                    object.attributes = attributes.clone();
                    object.last_modified_by = sequenced.user_id.clone();
                    object.last_modified_seq = sequenced.seq;
                } else {
                    log::warn!("Sequenced modify of missing object {}", object_id);
                }
            }
            Action::Removed { object_id } => {
                Arc::make_mut(&mut self.state.objects).remove(object_id);
                Arc::make_mut(&mut self.state.tombstones).insert(*object_id, sequenced.seq);
            }
        }
    }
}

impl ObjectReadable for BoardDocument {
    fn get_object(&self, object_id: &ObjectId) -> Option<&CanvasObject> {
        self.state.objects.get(object_id)
    }

    fn is_tombstoned(&self, object_id: &ObjectId) -> bool {
        self.state.tombstones.contains_key(object_id)
    }

    fn live_objects(&self) -> Box<dyn Iterator<Item = &CanvasObject> + '_> {
        Box::new(self.state.objects.values())
    }
}

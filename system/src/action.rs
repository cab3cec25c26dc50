use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::RejectReason;
use crate::object::{Attributes, ObjectKind};
use crate::types::*;

/// An edit as a client submits it. Fields are optional on the wire so that
/// malformed requests can be told apart from unknown ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionRequest {
    #[serde(rename_all = "camelCase")]
    Created {
        temp_id: ObjectId,
        kind: ObjectKind,
        attributes: Option<Attributes>,
    },
    #[serde(rename_all = "camelCase")]
    Modified {
        object_id: Option<ObjectId>,
        attributes: Option<Attributes>,
    },
    #[serde(rename_all = "camelCase")]
    Removed { object_id: Option<ObjectId> },
}

impl ActionRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Modified { .. } => "modified",
            Self::Removed { .. } => "removed",
        }
    }

    pub fn temp_id(&self) -> Option<ObjectId> {
        match self {
            Self::Created { temp_id, .. } => Some(*temp_id),
            _ => None,
        }
    }

    /// The object a modify/remove points at.
    pub fn target(&self) -> Option<ObjectId> {
        match self {
            Self::Created { .. } => None,
            Self::Modified { object_id, .. } | Self::Removed { object_id } => *object_id,
        }
    }

    /// Id the originator uses to refer to the object: temp id for creates.
    pub fn reference(&self) -> Option<ObjectId> {
        self.temp_id().or_else(|| self.target())
    }

    pub fn retarget(self, id: ObjectId) -> Self {
        match self {
            Self::Modified { attributes, .. } => Self::Modified {
                object_id: Some(id),
                attributes,
            },
            Self::Removed { .. } => Self::Removed {
                object_id: Some(id),
            },
            created => created,
        }
    }

    /// Checks the request's shape and binds it to its durable id.
    /// `durable_id` is only consulted for creates.
    pub fn into_action(self, durable_id: Option<ObjectId>) -> Result<Action, ActionError> {
        match self {
            Self::Created {
                temp_id,
                kind,
                attributes,
            } => Ok(Action::Created {
                object_id: durable_id.unwrap_or(temp_id),
                kind,
                attributes: attributes.ok_or(ActionError::MissingAttributes("created"))?,
            }),
            Self::Modified {
                object_id,
                attributes,
            } => Ok(Action::Modified {
                object_id: object_id.ok_or(ActionError::MissingObjectId("modified"))?,
                attributes: attributes.ok_or(ActionError::MissingAttributes("modified"))?,
            }),
            Self::Removed { object_id } => Ok(Action::Removed {
                object_id: object_id.ok_or(ActionError::MissingObjectId("removed"))?,
            }),
        }
    }
}

/// A validated edit. Created and modified always carry the whole payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    #[serde(rename_all = "camelCase")]
    Created {
        object_id: ObjectId,
        kind: ObjectKind,
        attributes: Attributes,
    },
    #[serde(rename_all = "camelCase")]
    Modified {
        object_id: ObjectId,
        attributes: Attributes,
    },
    #[serde(rename_all = "camelCase")]
    Removed { object_id: ObjectId },
}

impl Action {
    pub fn object_id(&self) -> ObjectId {
        match self {
            Self::Created { object_id, .. }
            | Self::Modified { object_id, .. }
            | Self::Removed { object_id } => *object_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedAction {
    pub seq: Seq,
    pub origin: ConnectionId,
    pub user_id: UserId,
    /// Client placeholder id, set for creates only.
    pub temp_id: Option<ObjectId>,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("{0} action is missing an object id")]
    MissingObjectId(&'static str),
    #[error("{0} action is missing its attribute payload")]
    MissingAttributes(&'static str),
    #[error("object {0} has been removed")]
    StaleReference(ObjectId),
    #[error("object {0} does not exist")]
    UnknownObject(ObjectId),
    #[error("object {0} already exists")]
    DuplicateObject(ObjectId),
    #[error("expected seq {expected} but got {got}")]
    OrderingGap { expected: Seq, got: Seq },
}

impl ActionError {
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            Self::MissingObjectId(_) | Self::MissingAttributes(_) | Self::OrderingGap { .. } => {
                RejectReason::Malformed
            }
            Self::StaleReference(_) => RejectReason::StaleReference,
            Self::UnknownObject(_) => RejectReason::UnknownObject,
            Self::DuplicateObject(_) => RejectReason::DuplicateObject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn it_rejects_modify_without_payload() {
        let request = ActionRequest::Modified {
            object_id: Some(uuid::Uuid::new_v4()),
            attributes: None,
        };
        assert_eq!(
            request.into_action(None),
            Err(ActionError::MissingAttributes("modified"))
        );
    }

    #[test]
    fn it_rejects_remove_without_object_id() {
        let request = ActionRequest::Removed { object_id: None };
        assert_eq!(
            request.into_action(None),
            Err(ActionError::MissingObjectId("removed"))
        );
    }

    #[test]
    fn it_binds_created_to_durable_id() {
        let temp_id = uuid::Uuid::new_v4();
        let durable_id = uuid::Uuid::new_v4();
        let request = ActionRequest::Created {
            temp_id,
            kind: ObjectKind::Rect,
            attributes: Some(Attributes::new(json!({ "fill": "red" }))),
        };
        let action = request.into_action(Some(durable_id)).unwrap();
        assert_eq!(action.object_id(), durable_id);
    }

    #[test]
    fn it_reads_missing_optional_fields_from_json() {
        let request: ActionRequest =
            serde_json::from_str(r#"{"modified":{"attributes":{"fill":"blue"}}}"#).unwrap();
        assert_eq!(request.target(), None);
        assert!(matches!(
            request.into_action(None),
            Err(ActionError::MissingObjectId(_))
        ));
    }
}

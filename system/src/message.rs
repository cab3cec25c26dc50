use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::{ActionRequest, SequencedAction};
use crate::object::CanvasObject;
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientMessage {
    /// `last_seq` resumes a previous session on the same board.
    #[serde(rename_all = "camelCase")]
    JoinBoard {
        board_id: BoardId,
        last_seq: Option<Seq>,
    },
    #[serde(rename_all = "camelCase")]
    LeaveBoard { board_id: BoardId },
    #[serde(rename_all = "camelCase")]
    CanvasAction {
        board_id: BoardId,
        action: ActionRequest,
    },
    #[serde(rename_all = "camelCase")]
    CursorMove { board_id: BoardId, x: f32, y: f32 },
    #[serde(rename_all = "camelCase")]
    RequestResync { board_id: BoardId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    BoardJoined {
        board_id: BoardId,
        connection_id: ConnectionId,
        view: BoardView,
        seq_at_capture: Seq,
        members: Vec<Member>,
    },
    #[serde(rename_all = "camelCase")]
    BoardResumed {
        board_id: BoardId,
        actions: Vec<SequencedAction>,
    },
    #[serde(rename_all = "camelCase")]
    CanvasUpdate {
        board_id: BoardId,
        action: SequencedAction,
    },
    #[serde(rename_all = "camelCase")]
    ActionProcessed {
        board_id: BoardId,
        seq: Seq,
        object_id: ObjectId,
        temp_id: Option<ObjectId>,
    },
    /// `object_id` is the id as the originator referred to it.
    #[serde(rename_all = "camelCase")]
    ActionRejected {
        board_id: BoardId,
        object_id: Option<ObjectId>,
        reason: RejectReason,
    },
    #[serde(rename_all = "camelCase")]
    CursorUpdate {
        board_id: BoardId,
        connection_id: ConnectionId,
        user_id: UserId,
        x: f32,
        y: f32,
    },
    #[serde(rename_all = "camelCase")]
    PresenceChanged {
        board_id: BoardId,
        members: Vec<Member>,
    },
    Error { kind: ErrorKind, message: String },
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    /// Cursor and presence traffic may be dropped under backpressure.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            Self::CursorUpdate { .. } | Self::PresenceChanged { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardView {
    pub snapshot_version: SnapshotVersion,
    pub objects: Vec<CanvasObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Protocol,
    NotJoined,
    Unauthorized,
    Overloaded,
    /// The board could not be loaded; joining again retries.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    Malformed,
    StaleReference,
    UnknownObject,
    DuplicateObject,
    Overloaded,
    /// The room no longer counts the sender as a member.
    NotJoined,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed json message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed binary message: {0}")]
    Binary(#[from] bincode::Error),
}

/// Encoding of a websocket frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Binary,
}

impl ClientMessage {
    pub fn decode(format: WireFormat, bytes: &[u8]) -> Result<Self, ProtocolError> {
        match format {
            WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
            WireFormat::Binary => Ok(bincode::deserialize(bytes)?),
        }
    }

    pub fn encode(&self, format: WireFormat) -> Result<Vec<u8>, ProtocolError> {
        match format {
            WireFormat::Json => Ok(serde_json::to_vec(self)?),
            WireFormat::Binary => Ok(bincode::serialize(self)?),
        }
    }
}

impl ServerMessage {
    pub fn decode(format: WireFormat, bytes: &[u8]) -> Result<Self, ProtocolError> {
        match format {
            WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
            WireFormat::Binary => Ok(bincode::deserialize(bytes)?),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_bincode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }
}

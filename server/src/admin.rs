use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot::Sender;

use system::{BoardId, SnapshotMeta};

use crate::room::RoomDescription;
use crate::snapshot_store::{PersistenceError, StoredSnapshot};

#[derive(Debug)]
pub enum AdminCommand {
    ListBoards {
        tx: Sender<Vec<BoardSummary>>,
    },
    DescribeBoard {
        board_id: BoardId,
        tx: Sender<Result<BoardDescription, AdminError>>,
    },
    TakeSnapshot {
        board_id: BoardId,
        tx: Sender<Result<SnapshotMeta, AdminError>>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSummary {
    pub board_id: BoardId,
    pub sessions: usize,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum BoardDescription {
    Online(RoomDescription),
    #[serde(rename_all = "camelCase")]
    Offline { board_id: BoardId, snapshots: Vec<StoredSnapshot> },
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("board {0} has no active room")]
    BoardOffline(BoardId),
    #[error("room of board {0} stopped before answering")]
    RoomGone(BoardId),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

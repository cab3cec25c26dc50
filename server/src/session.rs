use system::chrono::{DateTime, Utc};
use system::{BoardId, ConnectionId, Member, ServerMessage, UserId};

use crate::connection_tx_storage::ConnectionTx;

/// One connection's membership in a room.
pub struct Session {
    pub connection_id: ConnectionId,
    pub board_id: BoardId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub tx: ConnectionTx,
}

impl Session {
    pub fn new(connection_id: ConnectionId, board_id: BoardId, user_id: UserId, tx: ConnectionTx) -> Self {
        Self {
            connection_id,
            board_id,
            user_id,
            joined_at: Utc::now(),
            tx,
        }
    }

    pub fn member(&self) -> Member {
        Member {
            connection_id: self.connection_id,
            user_id: self.user_id.clone(),
            joined_at: self.joined_at,
        }
    }

    /// Returns `false` once the connection can no longer be written to.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.push(message)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("board_id", &self.board_id)
            .field("user_id", &self.user_id)
            .finish()
    }
}

use std::collections::{BTreeSet, HashMap};

use system::{BoardId, ConnectionId, Reconciler, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    InLobby,
    /// Waiting for the authorization verdict.
    Admitting(BoardId),
    Joined(BoardId),
}

pub struct ConnectionEntry {
    pub user_id: UserId,
    pub state: ConnectionState,
    pub reconciler: Reconciler,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ServerError {
    UnknownConnection,
    InvalidCommandForState,
}

/// Which connection is where. Owned by the gateway task.
pub struct ServerState {
    alias_capacity: usize,
    pub connections: HashMap<ConnectionId, ConnectionEntry>,
    pub boards: HashMap<BoardId, BTreeSet<ConnectionId>>,
}

impl ServerState {
    pub fn new(alias_capacity: usize) -> Self {
        Self {
            alias_capacity,
            connections: HashMap::new(),
            boards: HashMap::new(),
        }
    }

    pub fn connect(&mut self, connection_id: ConnectionId, user_id: UserId) {
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id,
                state: ConnectionState::InLobby,
                reconciler: Reconciler::new(self.alias_capacity),
            },
        );
    }

    /// Returns the board the connection was joined to.
    pub fn disconnect(&mut self, connection_id: &ConnectionId) -> Option<BoardId> {
        let board_id = self.joined_board(connection_id);
        if let Some(board_id) = board_id {
            self.remove_from_board(connection_id, &board_id);
        }
        self.connections.remove(connection_id);
        board_id
    }

    pub fn state(&self, connection_id: &ConnectionId) -> Option<ConnectionState> {
        self.connections.get(connection_id).map(|entry| entry.state)
    }

    pub fn user_id(&self, connection_id: &ConnectionId) -> Option<&UserId> {
        self.connections.get(connection_id).map(|entry| &entry.user_id)
    }

    pub fn joined_board(&self, connection_id: &ConnectionId) -> Option<BoardId> {
        match self.state(connection_id) {
            Some(ConnectionState::Joined(board_id)) => Some(board_id),
            _ => None,
        }
    }

    pub fn is_joined_to(&self, connection_id: &ConnectionId, board_id: &BoardId) -> bool {
        self.joined_board(connection_id) == Some(*board_id)
    }

    /// Starts admission to `board_id`, leaving the current board first.
    /// Returns the board that was left.
    pub fn begin_admission(
        &mut self,
        connection_id: &ConnectionId,
        board_id: BoardId,
    ) -> Result<Option<BoardId>, ServerError> {
        let left = self.joined_board(connection_id);
        if let Some(left) = left {
            self.remove_from_board(connection_id, &left);
        }
        let entry = self
            .connections
            .get_mut(connection_id)
            .ok_or(ServerError::UnknownConnection)?;
        entry.state = ConnectionState::Admitting(board_id);
        entry.reconciler.clear();
        Ok(left)
    }

    /// Completes an admission that is still wanted.
    pub fn admit(
        &mut self,
        connection_id: &ConnectionId,
        board_id: BoardId,
    ) -> Result<(), ServerError> {
        let entry = self
            .connections
            .get_mut(connection_id)
            .ok_or(ServerError::UnknownConnection)?;
        if entry.state != ConnectionState::Admitting(board_id) {
            return Err(ServerError::InvalidCommandForState);
        }
        entry.state = ConnectionState::Joined(board_id);
        self.boards.entry(board_id).or_default().insert(*connection_id);
        log::info!("Connection {} joined board {}", connection_id, board_id);
        Ok(())
    }

    pub fn deny(
        &mut self,
        connection_id: &ConnectionId,
        board_id: BoardId,
    ) -> Result<(), ServerError> {
        let entry = self
            .connections
            .get_mut(connection_id)
            .ok_or(ServerError::UnknownConnection)?;
        if entry.state != ConnectionState::Admitting(board_id) {
            return Err(ServerError::InvalidCommandForState);
        }
        entry.state = ConnectionState::InLobby;
        Ok(())
    }

    pub fn leave(
        &mut self,
        connection_id: &ConnectionId,
        board_id: &BoardId,
    ) -> Result<(), ServerError> {
        if !self.is_joined_to(connection_id, board_id) {
            return Err(ServerError::InvalidCommandForState);
        }
        self.remove_from_board(connection_id, board_id);
        if let Some(entry) = self.connections.get_mut(connection_id) {
            entry.state = ConnectionState::InLobby;
            entry.reconciler.clear();
        }
        Ok(())
    }

    pub fn reconciler_mut(&mut self, connection_id: &ConnectionId) -> Option<&mut Reconciler> {
        self.connections
            .get_mut(connection_id)
            .map(|entry| &mut entry.reconciler)
    }

    pub fn connection_ids_in_board(&self, board_id: &BoardId) -> Vec<ConnectionId> {
        self.boards
            .get(board_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_board_empty(&self, board_id: &BoardId) -> bool {
        self.boards
            .get(board_id)
            .map_or(true, |members| members.is_empty())
    }

    fn remove_from_board(&mut self, connection_id: &ConnectionId, board_id: &BoardId) {
        if let Some(members) = self.boards.get_mut(board_id) {
            members.remove(connection_id);
            if members.is_empty() {
                self.boards.remove(board_id);
            }
        }
        log::info!("Connection {} left board {}", connection_id, board_id);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use system::{ConnectionId, ServerMessage};

use crate::outbox::{CloseCause, Outbox};

pub type ConnectionTx = Arc<Outbox>;

pub struct ConnectionTxStorage {
    connection_txs: HashMap<ConnectionId, ConnectionTx>,
}

impl ConnectionTxStorage {
    pub fn new() -> Self {
        Self {
            connection_txs: HashMap::new(),
        }
    }

    pub fn insert(&mut self, connection_id: ConnectionId, tx: ConnectionTx) {
        self.connection_txs.insert(connection_id, tx);
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<&ConnectionTx> {
        self.connection_txs.get(connection_id)
    }

    pub fn send(&self, to: &ConnectionId, message: ServerMessage) {
        match self.connection_txs.get(to) {
            Some(tx) => {
                if !tx.push(message) {
                    log::debug!("Outbox of connection {} is closed", to);
                }
            }
            None => log::warn!("No outbox for connection {}", to),
        }
    }

    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<ConnectionTx> {
        let tx = self.connection_txs.remove(connection_id);
        if let Some(tx) = &tx {
            tx.close(CloseCause::Disconnected);
        }
        tx
    }

    pub fn len(&self) -> usize {
        self.connection_txs.len()
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use system::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Critical messages no longer fit; the client has to resume.
    Overflow,
    Disconnected,
}

#[derive(Debug, PartialEq)]
pub enum Delivery {
    Message(ServerMessage),
    Closed(CloseCause),
}

struct OutboxQueue {
    messages: VecDeque<ServerMessage>,
    closed: Option<CloseCause>,
}

/// Bounded queue of messages waiting to be written to one connection.
///
/// Producers (rooms, the gateway) never wait on it. When full, the oldest
/// cursor/presence message makes room; if only critical messages are queued
/// the outbox closes with [`CloseCause::Overflow`].
pub struct Outbox {
    capacity: usize,
    queue: Mutex<OutboxQueue>,
    notify: Notify,
}

impl Outbox {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            queue: Mutex::new(OutboxQueue {
                messages: VecDeque::new(),
                closed: None,
            }),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, OutboxQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` once the outbox is closed.
    pub fn push(&self, message: ServerMessage) -> bool {
        let mut queue = self.lock();
        if queue.closed.is_some() {
            return false;
        }
        if queue.messages.len() >= self.capacity {
            let droppable = queue
                .messages
                .iter()
                .position(|queued| !queued.is_critical());
            match droppable {
                Some(index) => {
                    queue.messages.remove(index);
                }
                None if !message.is_critical() => {
                    log::debug!("Outbox full, dropping {:?}", message);
                    return true;
                }
                None => {
                    log::warn!("Outbox overflow with {} critical messages", queue.messages.len());
                    queue.messages.clear();
                    queue.closed = Some(CloseCause::Overflow);
                    drop(queue);
                    self.notify.notify_one();
                    return false;
                }
            }
        }
        queue.messages.push_back(message);
        drop(queue);
        self.notify.notify_one();
        true
    }

    pub fn close(&self, cause: CloseCause) {
        let mut queue = self.lock();
        if queue.closed.is_none() {
            queue.closed = Some(cause);
        }
        drop(queue);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub fn try_recv(&self) -> Option<ServerMessage> {
        self.lock().messages.pop_front()
    }

    /// Waits for the next message. Queued messages are still handed out after
    /// a disconnect; an overflow discards them.
    pub async fn recv(&self) -> Delivery {
        loop {
            {
                let mut queue = self.lock();
                if let Some(message) = queue.messages.pop_front() {
                    return Delivery::Message(message);
                }
                if let Some(cause) = queue.closed {
                    return Delivery::Closed(cause);
                }
            }
            self.notify.notified().await;
        }
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.lock();
        f.debug_struct("Outbox")
            .field("capacity", &self.capacity)
            .field("queued", &queue.messages.len())
            .field("closed", &queue.closed)
            .finish()
    }
}

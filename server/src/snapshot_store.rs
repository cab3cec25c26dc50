use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use system::{BoardId, Snapshot, SnapshotBlob, SnapshotError, SnapshotMeta, SnapshotVersion};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    /// Worth another attempt; a snapshot that does not decode stays broken.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Snapshot(_))
    }
}

/// What a store knows about a snapshot without reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSnapshot {
    pub version: SnapshotVersion,
    pub is_auto: bool,
}

/// Durable home of board snapshots.
#[async_trait]
pub trait SnapshotPersistence: Send + Sync {
    async fn save(
        &self,
        board_id: BoardId,
        blob: SnapshotBlob,
        version: SnapshotVersion,
        is_auto: bool,
    ) -> Result<SnapshotMeta, PersistenceError>;

    /// A stored snapshot, or `None` when the version is not (or no longer)
    /// stored.
    async fn load(
        &self,
        board_id: BoardId,
        version: SnapshotVersion,
    ) -> Result<Option<Snapshot>, PersistenceError>;

    /// The snapshot with the highest version.
    async fn latest(&self, board_id: BoardId) -> Result<Option<Snapshot>, PersistenceError> {
        match self.list(board_id).await?.pop() {
            Some(newest) => self.load(board_id, newest.version).await,
            None => Ok(None),
        }
    }

    /// Every stored snapshot of the board, by ascending version.
    async fn list(&self, board_id: BoardId) -> Result<Vec<StoredSnapshot>, PersistenceError>;

    /// Deletes automatic snapshots beyond `keep_count`; returns the versions
    /// removed.
    async fn prune(
        &self,
        board_id: BoardId,
        keep_count: usize,
    ) -> Result<Vec<SnapshotVersion>, PersistenceError>;
}

/// Keeps snapshots in process memory.
#[derive(Default)]
pub struct MemorySnapshotStore {
    boards: Mutex<HashMap<BoardId, BTreeMap<SnapshotVersion, Snapshot>>>,
    failing_saves: AtomicU32,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` saves fail.
    pub fn fail_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BoardId, BTreeMap<SnapshotVersion, Snapshot>>> {
        self.boards.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SnapshotPersistence for MemorySnapshotStore {
    async fn save(
        &self,
        board_id: BoardId,
        blob: SnapshotBlob,
        version: SnapshotVersion,
        is_auto: bool,
    ) -> Result<SnapshotMeta, PersistenceError> {
        let failing = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(PersistenceError::Unavailable("injected failure".into()));
        }
        let snapshot = Snapshot::new(board_id, blob, version, is_auto);
        let meta = snapshot.meta.clone();
        self.lock()
            .entry(board_id)
            .or_default()
            .insert(version, snapshot);
        Ok(meta)
    }

    async fn load(
        &self,
        board_id: BoardId,
        version: SnapshotVersion,
    ) -> Result<Option<Snapshot>, PersistenceError> {
        Ok(self
            .lock()
            .get(&board_id)
            .and_then(|snapshots| snapshots.get(&version).cloned()))
    }

    async fn list(&self, board_id: BoardId) -> Result<Vec<StoredSnapshot>, PersistenceError> {
        Ok(self
            .lock()
            .get(&board_id)
            .map(|snapshots| {
                snapshots
                    .values()
                    .map(|snapshot| StoredSnapshot {
                        version: snapshot.meta.version,
                        is_auto: snapshot.meta.is_auto,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn prune(
        &self,
        board_id: BoardId,
        keep_count: usize,
    ) -> Result<Vec<SnapshotVersion>, PersistenceError> {
        let mut boards = self.lock();
        let snapshots = match boards.get_mut(&board_id) {
            Some(snapshots) => snapshots,
            None => return Ok(Vec::new()),
        };
        let pruned = system::versions_to_prune(
            snapshots
                .values()
                .map(|snapshot| (snapshot.meta.version, snapshot.meta.is_auto)),
            keep_count,
        );
        for version in &pruned {
            snapshots.remove(version);
        }
        Ok(pruned)
    }
}

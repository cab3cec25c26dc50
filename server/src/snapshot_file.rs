use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use system::{BoardId, Snapshot, SnapshotBlob, SnapshotMeta, SnapshotVersion};

use crate::snapshot_store::{PersistenceError, SnapshotPersistence, StoredSnapshot};

const EXTENSION: &str = "rcs";

/// One `.rcs` file per snapshot: `{board}.{version}.{auto|manual}.rcs`.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_of(&self, board_id: &BoardId, snapshot: StoredSnapshot) -> PathBuf {
        self.dir.join(create_file_name(board_id, snapshot))
    }
}

fn create_file_name(board_id: &BoardId, snapshot: StoredSnapshot) -> String {
    let kind = if snapshot.is_auto { "auto" } else { "manual" };
    format!("{}.{:020}.{}.{}", board_id, snapshot.version, kind, EXTENSION)
}

fn parse_file_name(file_name: &str) -> Option<(BoardId, StoredSnapshot)> {
    let mut parts = file_name.split('.');
    let board_id = parts.next()?.parse::<BoardId>().ok()?;
    let version = parts.next()?.parse::<SnapshotVersion>().ok()?;
    let is_auto = match parts.next()? {
        "auto" => true,
        "manual" => false,
        _ => return None,
    };
    if parts.next()? != EXTENSION || parts.next().is_some() {
        return None;
    }
    Some((board_id, StoredSnapshot { version, is_auto }))
}

async fn list_snapshot_files(dir: &Path, board_id: &BoardId) -> Result<Vec<StoredSnapshot>, PersistenceError> {
    let mut result = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(result),
        Err(error) => return Err(error.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let file_name = match entry.file_name().into_string() {
            Ok(file_name) => file_name,
            Err(_) => continue,
        };
        if let Some((owner, snapshot)) = parse_file_name(&file_name) {
            if owner == *board_id {
                result.push(snapshot);
            }
        }
    }
    result.sort_by_key(|snapshot| snapshot.version);
    Ok(result)
}

#[async_trait]
impl SnapshotPersistence for FileSnapshotStore {
    async fn save(
        &self,
        board_id: BoardId,
        blob: SnapshotBlob,
        version: SnapshotVersion,
        is_auto: bool,
    ) -> Result<SnapshotMeta, PersistenceError> {
        fs::create_dir_all(&self.dir).await?;
        let snapshot = Snapshot::new(board_id, blob, version, is_auto);
        let bytes = snapshot.to_bytes()?;
        let path = self.path_of(&board_id, StoredSnapshot { version, is_auto });
        let partial = path.with_extension("partial");
        fs::write(&partial, bytes).await?;
        fs::rename(&partial, &path).await?;
        log::debug!("Wrote snapshot {}", path.display());
        Ok(snapshot.meta)
    }

    async fn load(
        &self,
        board_id: BoardId,
        version: SnapshotVersion,
    ) -> Result<Option<Snapshot>, PersistenceError> {
        let stored = list_snapshot_files(&self.dir, &board_id)
            .await?
            .into_iter()
            .find(|snapshot| snapshot.version == version);
        let stored = match stored {
            Some(stored) => stored,
            None => return Ok(None),
        };
        let bytes = match fs::read(self.path_of(&board_id, stored)).await {
            Ok(bytes) => bytes,
            // pruned since it was listed
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        Ok(Some(Snapshot::from_bytes(&bytes)?))
    }

    async fn list(&self, board_id: BoardId) -> Result<Vec<StoredSnapshot>, PersistenceError> {
        list_snapshot_files(&self.dir, &board_id).await
    }

    async fn prune(
        &self,
        board_id: BoardId,
        keep_count: usize,
    ) -> Result<Vec<SnapshotVersion>, PersistenceError> {
        let stored = list_snapshot_files(&self.dir, &board_id).await?;
        let pruned = system::versions_to_prune(
            stored.iter().map(|snapshot| (snapshot.version, snapshot.is_auto)),
            keep_count,
        );
        for version in &pruned {
            let path = self.path_of(
                &board_id,
                StoredSnapshot {
                    version: *version,
                    is_auto: true,
                },
            );
            fs::remove_file(path).await?;
        }
        Ok(pruned)
    }
}

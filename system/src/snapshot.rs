use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::board_document::BoardState;
use crate::types::*;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to encode snapshot: {0}")]
    Encode(bincode::Error),
    #[error("failed to decode snapshot: {0}")]
    Decode(bincode::Error),
}

/// Serialized board state together with the seq it was captured at.
#[derive(Clone, Serialize, Deserialize)]
pub struct SnapshotBlob {
    seq: Seq,
    content: Vec<u8>,
}

impl std::fmt::Debug for SnapshotBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotBlob")
            .field("seq", &self.seq)
            .field("size", &self.content.len())
            .finish()
    }
}

impl SnapshotBlob {
    pub fn encode(state: &BoardState) -> Result<Self, SnapshotError> {
        Ok(Self {
            seq: state.seq,
            content: bincode::serialize(state).map_err(SnapshotError::Encode)?,
        })
    }

    pub fn decode(&self) -> Result<BoardState, SnapshotError> {
        bincode::deserialize(&self.content).map_err(SnapshotError::Decode)
    }

    pub fn seq(&self) -> Seq {
        self.seq
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub board_id: BoardId,
    pub version: SnapshotVersion,
    pub seq: Seq,
    pub taken_at: DateTime<Utc>,
    pub is_auto: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub blob: SnapshotBlob,
}

impl Snapshot {
    pub fn new(
        board_id: BoardId,
        blob: SnapshotBlob,
        version: SnapshotVersion,
        is_auto: bool,
    ) -> Self {
        Self {
            meta: SnapshotMeta {
                board_id,
                version,
                seq: blob.seq(),
                taken_at: Utc::now(),
                is_auto,
            },
            blob,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        bincode::serialize(self).map_err(SnapshotError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        bincode::deserialize(bytes).map_err(SnapshotError::Decode)
    }
}

/// Automatic snapshots past `keep_count`, oldest first. Manual snapshots are
/// never selected.
pub fn versions_to_prune<I>(snapshots: I, keep_count: usize) -> Vec<SnapshotVersion>
where
    I: IntoIterator<Item = (SnapshotVersion, bool)>,
{
    let mut auto_versions = snapshots
        .into_iter()
        .filter(|(_, is_auto)| *is_auto)
        .map(|(version, _)| version)
        .collect::<Vec<_>>();
    auto_versions.sort_unstable();
    let excess = auto_versions.len().saturating_sub(keep_count);
    auto_versions.truncate(excess);
    auto_versions
}

/// Decides when a room should take its next automatic snapshot.
#[derive(Debug)]
pub struct SnapshotSchedule {
    action_threshold: u64,
    interval: Duration,
    actions_since: u64,
    last_taken_at: Instant,
}

impl SnapshotSchedule {
    pub fn new(action_threshold: u64, interval: Duration, now: Instant) -> Self {
        Self {
            action_threshold,
            interval,
            actions_since: 0,
            last_taken_at: now,
        }
    }

    pub fn record_action(&mut self) {
        self.actions_since += 1;
    }

    pub fn actions_since(&self) -> u64 {
        self.actions_since
    }

    /// Nothing is due while no action was accepted since the last snapshot.
    pub fn is_due(&self, now: Instant) -> bool {
        self.actions_since > 0
            && (self.actions_since >= self.action_threshold
                || now.duration_since(self.last_taken_at) >= self.interval)
    }

    pub fn mark_taken(&mut self, now: Instant) {
        self.actions_since = 0;
        self.last_taken_at = now;
    }
}

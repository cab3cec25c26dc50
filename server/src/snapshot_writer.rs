use std::future::Future;
use std::time::Duration;

use system::{BoardId, BoardState, SnapshotBlob, SnapshotMeta, SnapshotVersion};

use crate::snapshot_store::{PersistenceError, SnapshotPersistence};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(MAX_BACKOFF, |backoff| backoff.min(MAX_BACKOFF))
    }
}

/// Runs `operation` until it succeeds, fails with an error that retrying
/// cannot fix, or `policy` runs out of attempts.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, PersistenceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PersistenceError>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                let backoff = policy.backoff(attempt);
                log::warn!(
                    "{} failed (attempt {}), retrying in {:?}: {}",
                    what,
                    attempt,
                    backoff,
                    error
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(error) => {
                log::error!("Giving up on {} after {} attempts: {}", what, attempt, error);
                return Err(error);
            }
        }
    }
}

/// Encodes `state` and saves it, retrying failed saves with exponential
/// backoff.
pub async fn write_snapshot(
    store: &dyn SnapshotPersistence,
    board_id: BoardId,
    state: BoardState,
    version: SnapshotVersion,
    is_auto: bool,
    policy: RetryPolicy,
) -> Result<SnapshotMeta, PersistenceError> {
    let blob = SnapshotBlob::encode(&state)?;
    let what = format!("snapshot {} of board {}", version, board_id);
    let meta = retry(policy, &what, || store.save(board_id, blob.clone(), version, is_auto)).await?;
    log::info!("Snapshot {} of board {} written at seq {}", meta.version, board_id, meta.seq);
    Ok(meta)
}

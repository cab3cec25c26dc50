use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use system::{BoardId, UserId};

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("board service request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Decides whether a user may join a board.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn can_access(&self, user_id: &str, board_id: BoardId) -> Result<bool, AuthorizationError>;
}

pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn can_access(&self, _user_id: &str, _board_id: BoardId) -> Result<bool, AuthorizationError> {
        Ok(true)
    }
}

#[derive(Deserialize)]
struct AccessVerdict {
    allowed: bool,
}

/// Asks the board metadata service, caching verdicts for a while.
pub struct BoardServiceAuthorizer {
    client: Client,
    base_url: String,
    verdicts: Cache<(UserId, BoardId), bool>,
}

impl BoardServiceAuthorizer {
    pub fn new(base_url: impl Into<String>, ttl: Duration) -> Result<Self, AuthorizationError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            verdicts: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(ttl)
                .build(),
        })
    }

    fn access_url(&self, user_id: &str, board_id: BoardId) -> String {
        format!("{}/boards/{}/access/{}", self.base_url, board_id, user_id)
    }
}

#[async_trait]
impl Authorizer for BoardServiceAuthorizer {
    async fn can_access(&self, user_id: &str, board_id: BoardId) -> Result<bool, AuthorizationError> {
        let key = (user_id.to_owned(), board_id);
        if let Some(allowed) = self.verdicts.get(&key).await {
            return Ok(allowed);
        }
        let verdict: AccessVerdict = self
            .client
            .get(self.access_url(user_id, board_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        log::debug!(
            "Board service: user {} {} board {}",
            user_id,
            if verdict.allowed { "may open" } else { "may not open" },
            board_id
        );
        self.verdicts.insert(key, verdict.allowed).await;
        Ok(verdict.allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_builds_the_access_url_without_double_slashes() {
        let authorizer =
            BoardServiceAuthorizer::new("http://boards.internal/", Duration::from_secs(1)).unwrap();
        let board_id = system::uuid::Uuid::nil();
        assert_eq!(
            authorizer.access_url("alice", board_id),
            format!("http://boards.internal/boards/{}/access/alice", board_id)
        );
    }

    #[tokio::test]
    async fn it_serves_cached_verdicts() {
        // nothing listens here; a cache miss would fail
        let authorizer =
            BoardServiceAuthorizer::new("http://127.0.0.1:9", Duration::from_secs(60)).unwrap();
        let board_id = system::uuid::Uuid::new_v4();
        authorizer
            .verdicts
            .insert(("alice".to_owned(), board_id), false)
            .await;
        assert!(!authorizer.can_access("alice", board_id).await.unwrap());
        assert!(authorizer.can_access("bob", board_id).await.is_err());
    }
}

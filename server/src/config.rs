use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::snapshot_writer::RetryPolicy;

/// Server configuration, read from `BOARDSYNC_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding `.rcs` snapshot files
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default = "default_snapshot_action_threshold")]
    pub snapshot_action_threshold: u64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// Automatic snapshots kept per board; manual ones are never pruned
    #[serde(default = "default_snapshot_keep_count")]
    pub snapshot_keep_count: usize,
    #[serde(default = "default_persistence_max_attempts")]
    pub persistence_max_attempts: u32,
    #[serde(default = "default_persistence_backoff_ms")]
    pub persistence_backoff_ms: u64,

    /// Sequenced actions kept per room for resume replay
    #[serde(default = "default_action_log_retention")]
    pub action_log_retention: usize,
    #[serde(default = "default_alias_capacity")]
    pub alias_capacity: usize,

    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    #[serde(default = "default_room_queue_capacity")]
    pub room_queue_capacity: usize,
    #[serde(default = "default_gateway_queue_capacity")]
    pub gateway_queue_capacity: usize,
    #[serde(default = "default_room_eviction_grace_secs")]
    pub room_eviction_grace_secs: u64,
    #[serde(default = "default_room_workers")]
    pub room_workers: usize,

    /// Board metadata service; every join is allowed when unset
    pub board_service_url: Option<String>,
    #[serde(default = "default_authz_cache_ttl_secs")]
    pub authz_cache_ttl_secs: u64,

    /// Comma separated; any origin when unset
    pub cors_origins: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable error: {0}")]
    Env(#[from] envy::Error),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl Config {
    /// Loads `.env` if present, then reads the environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(error) = dotenvy::dotenv() {
            log::debug!("No .env file loaded: {}", error);
        }
        let config = envy::prefixed("BOARDSYNC_").from_env::<Config>()?;
        config.validate()?;
        log::info!("Configuration loaded, listening on {}", config.server_address());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("outbox_capacity", self.outbox_capacity),
            ("room_queue_capacity", self.room_queue_capacity),
            ("gateway_queue_capacity", self.gateway_queue_capacity),
            ("room_workers", self.room_workers),
            ("persistence_max_attempts", self.persistence_max_attempts as usize),
            ("snapshot_interval_secs", self.snapshot_interval_secs as usize),
        ];
        match non_zero.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::Zero(*name)),
            None => Ok(()),
        }
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn room_eviction_grace(&self) -> Duration {
        Duration::from_secs(self.room_eviction_grace_secs)
    }

    pub fn authz_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.authz_cache_ttl_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.persistence_max_attempts,
            initial_backoff: Duration::from_millis(self.persistence_backoff_ms),
        }
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .map(|origins| {
                origins
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            snapshot_dir: default_snapshot_dir(),
            snapshot_action_threshold: default_snapshot_action_threshold(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            snapshot_keep_count: default_snapshot_keep_count(),
            persistence_max_attempts: default_persistence_max_attempts(),
            persistence_backoff_ms: default_persistence_backoff_ms(),
            action_log_retention: default_action_log_retention(),
            alias_capacity: default_alias_capacity(),
            outbox_capacity: default_outbox_capacity(),
            room_queue_capacity: default_room_queue_capacity(),
            gateway_queue_capacity: default_gateway_queue_capacity(),
            room_eviction_grace_secs: default_room_eviction_grace_secs(),
            room_workers: default_room_workers(),
            board_service_url: None,
            authz_cache_ttl_secs: default_authz_cache_ttl_secs(),
            cors_origins: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

fn default_snapshot_action_threshold() -> u64 {
    500
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_snapshot_keep_count() -> usize {
    10
}

fn default_persistence_max_attempts() -> u32 {
    5
}

fn default_persistence_backoff_ms() -> u64 {
    200
}

fn default_action_log_retention() -> usize {
    1000
}

fn default_alias_capacity() -> usize {
    256
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_room_queue_capacity() -> usize {
    1024
}

fn default_gateway_queue_capacity() -> usize {
    4096
}

fn default_room_eviction_grace_secs() -> u64 {
    30
}

fn default_room_workers() -> usize {
    4
}

fn default_authz_cache_ttl_secs() -> u64 {
    30
}

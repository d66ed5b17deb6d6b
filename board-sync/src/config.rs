//! Server configuration.
//!
//! Every field has a default; `from_env` overrides them from `BOARD_SYNC_*`
//! variables:
//!
//! | Variable                              | Field                       |
//! |---------------------------------------|-----------------------------|
//! | `BOARD_SYNC_BIND_ADDR`                | `bind_addr`                 |
//! | `BOARD_SYNC_BROADCAST_CAPACITY`       | `broadcast_capacity`        |
//! | `BOARD_SYNC_STORAGE_PATH`             | `storage_path`              |
//! | `BOARD_SYNC_REDO_POLICY`              | `redo_policy`               |
//! | `BOARD_SYNC_MAX_CONNECTIONS_PER_BOARD`| `max_connections_per_board` |
//! | `BOARD_SYNC_HEARTBEAT_SECS`           | `heartbeat_interval_secs`   |

use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::action_log::RedoPolicy;

const ENV_PREFIX: &str = "BOARD_SYNC_";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum simultaneous connections per board
    pub max_connections_per_board: usize,
    /// Events buffered per connection before it is considered lagging
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Redo stack behaviour on new commits
    pub redo_policy: RedoPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_connections_per_board: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            redo_policy: RedoPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory storage, small buffers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_connections_per_board: 16,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 0,
            storage_path: None,
            redo_policy: RedoPolicy::default(),
        }
    }

    /// Defaults overridden by `BOARD_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ServerConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        };

        let mut config = Self::default();

        if let Some((_, addr)) = var("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some((key, value)) = var("BROADCAST_CAPACITY") {
            config.broadcast_capacity = parse_positive(&key, &value)?;
        }
        if let Some((key, value)) = var("MAX_CONNECTIONS_PER_BOARD") {
            config.max_connections_per_board = parse_positive(&key, &value)?;
        }
        if let Some((key, value)) = var("HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = parse(&key, &value)?;
        }
        if let Some((_, path)) = var("STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some((key, value)) = var("REDO_POLICY") {
            config.redo_policy =
                RedoPolicy::parse(&value).ok_or_else(|| ConfigError::InvalidValue {
                    key,
                    value,
                    reason: "expected clear_on_commit or preserve".into(),
                })?;
        }

        Ok(config)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive(key: &str, value: &str) -> Result<usize, ConfigError> {
    match parse::<usize>(key, value)? {
        0 => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        }),
        n => Ok(n),
    }
}

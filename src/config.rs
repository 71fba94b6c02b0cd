//! Node configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Options recognized by a node and its transport.
///
/// Durations are carried as milliseconds; a zero timeout disables the
/// corresponding deadline. The RPC, discovery and database-path fields are
/// recognized here but consumed by outer layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-request reply deadline. Zero waits forever.
    pub response_timeout_ms: u64,
    /// Idle keepalive period. Zero disables the ping loop.
    pub ping_interval_ms: u64,

    // transport tuning
    pub max_connections: usize,
    pub max_message_size: usize,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub read_queue_len: usize,
    pub write_queue_len: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub dial_timeout_ms: u64,
    pub redial_timeout_ms: u64,
    pub max_redial_timeout_ms: u64,
    pub dials_limit: usize,

    /// Whether `RqList` is answered with this node's feed set.
    pub public_server: bool,
    pub enable_listener: bool,
    pub listen: String,
    pub remote_close: bool,

    // consumed by outer layers
    pub enable_rpc: bool,
    pub rpc_address: String,
    pub in_memory_db: bool,
    pub db_path: String,
    pub data_dir: String,
    pub discovery_addresses: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5_000,
            ping_interval_ms: 118_000,
            max_connections: 256,
            max_message_size: 8 << 20,
            read_timeout_ms: 0,
            write_timeout_ms: 10_000,
            read_queue_len: 128,
            write_queue_len: 128,
            read_buffer_size: 64 << 10,
            write_buffer_size: 64 << 10,
            dial_timeout_ms: 10_000,
            redial_timeout_ms: 1_000,
            max_redial_timeout_ms: 60_000,
            dials_limit: 16,
            public_server: false,
            enable_listener: false,
            listen: "127.0.0.1:8870".to_string(),
            remote_close: false,
            enable_rpc: false,
            rpc_address: String::new(),
            in_memory_db: true,
            db_path: String::new(),
            data_dir: String::new(),
            discovery_addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_message_size must be positive")]
    ZeroMessageSize,
    #[error("max_connections must be positive")]
    ZeroMaxConnections,
    #[error("{0} must be positive")]
    ZeroQueueLen(&'static str),
    #[error("listener enabled with empty listen address")]
    EmptyListen,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::ZeroMessageSize);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }
        if self.read_queue_len == 0 {
            return Err(ConfigError::ZeroQueueLen("read_queue_len"));
        }
        if self.write_queue_len == 0 {
            return Err(ConfigError::ZeroQueueLen("write_queue_len"));
        }
        if self.enable_listener && self.listen.is_empty() {
            return Err(ConfigError::EmptyListen);
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        match self.write_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_message_size_rejected() {
        let mut config = Config::default();
        config.max_message_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroMessageSize));
    }

    #[test]
    fn empty_listen_rejected_when_listener_enabled() {
        let mut config = Config::default();
        config.enable_listener = true;
        config.listen = String::new();
        assert_eq!(config.validate(), Err(ConfigError::EmptyListen));
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let mut config = Config::default();
        config.response_timeout_ms = 0;
        assert!(config.response_timeout().is_zero());
        config.write_timeout_ms = 0;
        assert_eq!(config.write_timeout(), None);
    }
}

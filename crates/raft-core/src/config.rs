//! # config
//!
//! why: keep every timing knob of servers and clients in one place
//! relations: consumed by node.rs and client.rs, loaded by the raft-cluster binary
//! what: RaftConfig, ClientConfig, ClusterConfig (json loadable, with defaults)

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Timing configuration for consensus servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max_ms: u64,
    /// Interval between two leader broadcasts
    pub heartbeat_interval_ms: u64,
    /// Smallest pause between two ticks, applied even at high speed
    pub min_tick_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 200,
            election_timeout_max_ms: 400,
            heartbeat_interval_ms: 25,
            min_tick_ms: 1,
        }
    }
}

impl RaftConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn min_tick(&self) -> Duration {
        Duration::from_millis(self.min_tick_ms)
    }
}

/// Timing configuration for client proxies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Leader-discovery retry interval and entry acknowledgement timeout
    pub timeout_ms: u64,
    pub min_tick_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 100,
            min_tick_ms: 1,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn min_tick(&self) -> Duration {
        Duration::from_millis(self.min_tick_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub raft: RaftConfig,
    pub client: ClientConfig,
}

impl ClusterConfig {
    /// Load from a json file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RaftError;
    use tempfile::tempdir;

    #[test]
    fn default_config_values() {
        let config = ClusterConfig::default();
        assert_eq!(config.raft.election_timeout_min_ms, 200);
        assert_eq!(config.raft.election_timeout_max_ms, 400);
        assert_eq!(config.raft.heartbeat_interval(), Duration::from_millis(25));
        assert_eq!(config.client.timeout(), Duration::from_millis(100));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        fs::write(&path, r#"{"raft":{"heartbeat_interval_ms":10}}"#).unwrap();

        let config = ClusterConfig::from_json_file(&path).unwrap();
        assert_eq!(config.raft.heartbeat_interval_ms, 10);
        assert_eq!(config.raft.election_timeout_min_ms, 200);
        assert_eq!(config.client, ClientConfig::default());
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let result = ClusterConfig::from_json_file(dir.path().join("absent.json"));
        assert!(matches!(result, Err(RaftError::Io(_))));
    }

    #[test]
    fn malformed_file_is_codec_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        fs::write(&path, "{ raft: ").unwrap();
        assert!(matches!(
            ClusterConfig::from_json_file(&path),
            Err(RaftError::Codec(_))
        ));
    }
}

//! RelayKV Configuration
//!
//! This module provides configuration structures for a RelayKV node:
//! where it listens, which leader it follows (if any), the scheduler and
//! replication timings, the snapshot location and logging.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main RelayKV configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Replication and scheduling configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Snapshot storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to bind the client/replication listener on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Listening port (0 picks a free port)
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Leader to follow, as "host port" or "host:port". Absent means leader role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicaof: Option<String>,

    /// Command loop sleep after a tick that found no work
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,

    /// Leader link sleep when its request queue is empty
    #[serde(default = "default_link_backoff_ms")]
    pub link_backoff_ms: u64,

    /// Interval between unsolicited REPLCONF ACKs from a follower (0 = disabled)
    #[serde(default = "default_ack_interval_ms")]
    pub ack_interval_ms: u64,

    /// Time a WAIT allows for writing GETACK to one follower before dropping it
    #[serde(default = "default_wait_grace_ms")]
    pub wait_grace_ms: u64,

    /// Maximum concurrent GETACK dispatch tasks per WAIT
    #[serde(default = "default_max_ack_dispatch")]
    pub max_ack_dispatch: usize,

    /// Timeout for connecting to the leader
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Snapshot storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the snapshot file
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Snapshot file name
    #[serde(default = "default_dbfilename")]
    pub dbfilename: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_idle_backoff_ms() -> u64 {
    1
}

fn default_link_backoff_ms() -> u64 {
    5
}

fn default_ack_interval_ms() -> u64 {
    1000
}

fn default_wait_grace_ms() -> u64 {
    2000
}

fn default_max_ack_dispatch() -> usize {
    16
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_dbfilename() -> String {
    "dump.rdb".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replicaof: None,
            idle_backoff_ms: default_idle_backoff_ms(),
            link_backoff_ms: default_link_backoff_ms(),
            ack_interval_ms: default_ack_interval_ms(),
            wait_grace_ms: default_wait_grace_ms(),
            max_ack_dispatch: default_max_ack_dispatch(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            dbfilename: default_dbfilename(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.replication.max_ack_dispatch == 0 {
            return Err(crate::Error::Config(
                "replication.max_ack_dispatch must be at least 1".into(),
            ));
        }

        if self.replication.replicaof.is_some() {
            self.leader_address()?;
        }

        Ok(())
    }

    /// Address the listener binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.node.bind_address, self.node.port)
    }

    /// Check if this node follows a leader
    pub fn is_follower(&self) -> bool {
        self.replication.replicaof.is_some()
    }

    /// Leader address as (host, port), if this node is a follower
    pub fn leader_address(&self) -> crate::Result<Option<(String, u16)>> {
        match &self.replication.replicaof {
            Some(spec) => parse_replicaof(spec).map(Some),
            None => Ok(None),
        }
    }

    /// Full path of the snapshot file
    pub fn snapshot_path(&self) -> PathBuf {
        self.storage.dir.join(&self.storage.dbfilename)
    }

    /// Get idle backoff as Duration
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.replication.idle_backoff_ms)
    }

    /// Get link backoff as Duration
    pub fn link_backoff(&self) -> Duration {
        Duration::from_millis(self.replication.link_backoff_ms)
    }

    /// Get follower ACK interval, if periodic ACKs are enabled
    pub fn ack_interval(&self) -> Option<Duration> {
        match self.replication.ack_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Get WAIT grace period as Duration
    pub fn wait_grace(&self) -> Duration {
        Duration::from_millis(self.replication.wait_grace_ms)
    }

    /// Get leader connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.connect_timeout_ms)
    }
}

/// Parse "host port" or "host:port"
pub fn parse_replicaof(spec: &str) -> crate::Result<(String, u16)> {
    let spec = spec.trim();
    let (host, port) = match spec.split_once(char::is_whitespace) {
        Some((host, port)) => (host.trim(), port.trim()),
        None => spec.rsplit_once(':').ok_or_else(|| {
            crate::Error::Config(format!("replicaof must be \"host port\", got '{}'", spec))
        })?,
    };

    if host.is_empty() {
        return Err(crate::Error::Config(format!("replicaof has no host: '{}'", spec)));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| crate::Error::Config(format!("replicaof has an invalid port: '{}'", spec)))?;

    Ok((host.to_string(), port))
}

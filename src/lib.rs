//! RelayKV - Key-Value Server with Single-Leader Replication
//!
//! A Redis-compatible key-value server speaking RESP over TCP. One node
//! acts as leader and streams every write to its followers; followers
//! attach with the PSYNC handshake, load the leader's RDB snapshot and
//! apply the command stream from there on.
//!
//! # Architecture
//!
//! Connections are accepted by an accept loop and handed to a single
//! command loop that owns the keyspace and services every connection in
//! turn. Followers acknowledge their processed offset with REPLCONF ACK,
//! which feeds the ack coordinator behind the WAIT command.
//!
//! # Features
//!
//! - RESP2 codec with inline commands and pipelining
//! - String keyspace with millisecond expiry and RDB snapshots
//! - PSYNC handshake with full resynchronization
//! - Command propagation with byte-exact replication offsets
//! - WAIT quorum acknowledgments with bounded GETACK dispatch

pub mod command;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod protocol;
pub mod replication;
pub mod scheduler;
pub mod store;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use node::{Node, NodeHandle, Shutdown};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::command::{Command, CommandKind};
    pub use crate::config::RelayConfig;
    pub use crate::error::{Error, Result};
    pub use crate::network::RespClient;
    pub use crate::node::{Node, NodeHandle};
    pub use crate::protocol::RespValue;
    pub use crate::replication::{ReplicationState, Role};
    pub use crate::store::Store;
}

//! Replication State
//!
//! Per-node replication counters. On a leader: the replication id, the
//! total bytes propagated and each follower's acknowledged offset. On a
//! follower: the bytes consumed from the leader's stream and what the
//! FULLRESYNC told us about the leader.

use parking_lot::RwLock;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::network::ConnectionId;

/// Replication role of this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower { host: String, port: u16 },
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "master"),
            Role::Follower { .. } => write!(f, "slave"),
        }
    }
}

/// A follower that completed its handshake
#[derive(Debug, Clone)]
pub struct FollowerRecord {
    pub peer: SocketAddr,
    /// Port from REPLCONF listening-port
    pub listening_port: Option<u16>,
    /// Last offset from REPLCONF ACK; `None` until the first ACK
    pub acked_offset: Option<u64>,
}

/// Generate a 40 character hex replication id
pub fn generate_replid() -> String {
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

/// Replication counters for one node
#[derive(Debug)]
pub struct ReplicationState {
    role: Role,
    replid: String,
    /// Leader: bytes propagated. Follower: unused.
    offset: AtomicU64,
    /// Keyed by connection id, which orders followers by registration
    followers: RwLock<BTreeMap<ConnectionId, FollowerRecord>>,
    /// Follower: leader stream position applied, counted from the leader's start
    processed: AtomicU64,
    /// Follower: leader link established and streaming
    link_up: AtomicBool,
    /// Follower: (replid, offset) announced in FULLRESYNC
    leader_sync: RwLock<Option<(String, u64)>>,
}

impl ReplicationState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            replid: generate_replid(),
            offset: AtomicU64::new(0),
            followers: RwLock::new(BTreeMap::new()),
            processed: AtomicU64::new(0),
            link_up: AtomicBool::new(false),
            leader_sync: RwLock::new(None),
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn replid(&self) -> &str {
        &self.replid
    }

    // Leader side

    /// Total bytes propagated to followers
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Account for propagated bytes, returning the new offset
    pub fn advance_offset(&self, len: u64) -> u64 {
        self.offset.fetch_add(len, Ordering::SeqCst) + len
    }

    /// Record a follower whose handshake just completed
    pub fn add_follower(&self, id: ConnectionId, peer: SocketAddr, listening_port: Option<u16>) {
        self.followers.write().insert(
            id,
            FollowerRecord {
                peer,
                listening_port,
                acked_offset: None,
            },
        );
        tracing::info!(peer = %peer, follower = %id, "Follower streaming");
    }

    pub fn remove_follower(&self, id: ConnectionId) -> Option<FollowerRecord> {
        let removed = self.followers.write().remove(&id);
        if let Some(record) = &removed {
            tracing::info!(peer = %record.peer, follower = %id, "Follower removed");
        }
        removed
    }

    /// Store an acknowledged offset. A lower value than the stored one is
    /// rejected; an equal one is accepted.
    pub fn record_ack(&self, id: ConnectionId, reported: u64) -> Result<()> {
        let mut followers = self.followers.write();
        let record = followers
            .get_mut(&id)
            .ok_or_else(|| Error::Replication(format!("ACK from unknown follower {}", id)))?;

        if let Some(previous) = record.acked_offset {
            if reported < previous {
                return Err(Error::AckRegression {
                    follower: record.peer.to_string(),
                    previous,
                    reported,
                });
            }
        }
        record.acked_offset = Some(reported);
        tracing::trace!(follower = %id, offset = reported, "ACK recorded");
        Ok(())
    }

    pub fn acked_offset(&self, id: ConnectionId) -> Option<u64> {
        self.followers.read().get(&id).and_then(|r| r.acked_offset)
    }

    /// Consistent copy of all follower records, in registration order
    pub fn followers(&self) -> Vec<(ConnectionId, FollowerRecord)> {
        self.followers
            .read()
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect()
    }

    pub fn follower_count(&self) -> usize {
        self.followers.read().len()
    }

    // Follower side

    pub fn processed_offset(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn set_processed_offset(&self, offset: u64) {
        self.processed.store(offset, Ordering::SeqCst);
    }

    pub fn link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::SeqCst);
    }

    /// Remember what FULLRESYNC announced
    pub fn set_leader_sync(&self, replid: String, offset: u64) {
        *self.leader_sync.write() = Some((replid, offset));
    }

    pub fn leader_sync(&self) -> Option<(String, u64)> {
        self.leader_sync.read().clone()
    }

    /// INFO replication section
    pub fn info(&self) -> String {
        let mut out = String::from("# Replication\r\n");
        let _ = write!(out, "role:{}\r\n", self.role);

        match &self.role {
            Role::Leader => {
                let followers = self.followers();
                let _ = write!(out, "connected_slaves:{}\r\n", followers.len());
                for (i, (_, record)) in followers.iter().enumerate() {
                    let _ = write!(
                        out,
                        "slave{}:ip={},port={},state=online,offset={},lag=0\r\n",
                        i,
                        record.peer.ip(),
                        record.listening_port.unwrap_or_else(|| record.peer.port()),
                        record.acked_offset.unwrap_or(0)
                    );
                }
                let _ = write!(out, "master_replid:{}\r\n", self.replid);
                let _ = write!(out, "master_repl_offset:{}\r\n", self.offset());
            }
            Role::Follower { host, port } => {
                let processed = self.processed_offset();
                let leader_replid = self
                    .leader_sync()
                    .map(|(replid, _)| replid)
                    .unwrap_or_else(|| "?".to_string());
                let _ = write!(out, "master_host:{}\r\n", host);
                let _ = write!(out, "master_port:{}\r\n", port);
                let _ = write!(
                    out,
                    "master_link_status:{}\r\n",
                    if self.link_up() { "up" } else { "down" }
                );
                let _ = write!(out, "slave_repl_offset:{}\r\n", processed);
                let _ = write!(out, "master_replid:{}\r\n", leader_replid);
                let _ = write!(out, "master_repl_offset:{}\r\n", processed);
            }
        }
        out
    }
}

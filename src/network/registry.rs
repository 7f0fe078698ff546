//! Connection Registry
//!
//! Owned by the command loop. The accept loop and the leader link never
//! touch it directly; they send [`Registration`]s over a channel that the
//! loop admits at the start of each tick, so iteration with removal
//! never races with insertion.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::connection::{Connection, ConnectionId};
use crate::replication::handshake::FollowerHandshake;
use crate::store::Store;

/// What a registered connection is to this node
#[derive(Debug)]
pub enum ConnectionRole {
    /// Ordinary client, possibly partway through a follower handshake
    Client(FollowerHandshake),
    /// Handshake complete: replication-only, reads only REPLCONF ACK
    Follower,
    /// This node's link to its leader, carrying the replication stream
    Leader,
}

impl ConnectionRole {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionRole::Client(_) => "client",
            ConnectionRole::Follower => "follower",
            ConnectionRole::Leader => "leader",
        }
    }
}

/// A connection plus its scheduling state
#[derive(Debug)]
pub struct RegistryEntry {
    pub conn: Connection,
    pub role: ConnectionRole,
    /// Reply task for a WAIT issued on this connection; no further
    /// commands are read until it finishes
    pub blocked_on: Option<JoinHandle<()>>,
}

impl RegistryEntry {
    fn new(conn: Connection, role: ConnectionRole) -> Self {
        Self {
            conn,
            role,
            blocked_on: None,
        }
    }

    /// Check whether a pending reply still holds this connection
    pub fn is_blocked(&mut self) -> bool {
        match &self.blocked_on {
            Some(handle) if !handle.is_finished() => true,
            Some(_) => {
                self.blocked_on = None;
                false
            }
            None => false,
        }
    }
}

/// Work handed to the command loop from other tasks
pub enum Registration {
    /// A freshly accepted client connection
    Client(Connection),
    /// The leader link after a completed handshake, with the decoded snapshot
    Leader { conn: Connection, snapshot: Store },
}

/// Sending side used by the accept loop and leader link
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<Registration>,
}

impl RegistryHandle {
    /// Hand a registration to the command loop
    ///
    /// Returns the registration back if the loop is gone.
    pub fn register(&self, registration: Registration) -> std::result::Result<(), Registration> {
        self.tx.send(registration).map_err(|e| e.0)
    }
}

/// All live connections on a node, in registration order
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    /// Create a registry and the handle that feeds it
    pub fn channel() -> (RegistryHandle, mpsc::UnboundedReceiver<Registration>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RegistryHandle { tx }, rx)
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, conn: Connection, role: ConnectionRole) -> ConnectionId {
        let id = conn.id();
        self.entries.push(RegistryEntry::new(conn, role));
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries_mut(&mut self) -> std::slice::IterMut<'_, RegistryEntry> {
        self.entries.iter_mut()
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut RegistryEntry> {
        self.entries.iter_mut().find(|entry| entry.conn.id() == id)
    }

    /// Number of connections in each role: (clients, followers, leader links)
    pub fn role_counts(&self) -> (usize, usize, usize) {
        self.entries
            .iter()
            .fold((0, 0, 0), |(c, f, l), entry| match entry.role {
                ConnectionRole::Client(_) => (c + 1, f, l),
                ConnectionRole::Follower => (c, f + 1, l),
                ConnectionRole::Leader => (c, f, l + 1),
            })
    }

    /// Remove closed connections, returning them for cleanup
    pub fn sweep(&mut self) -> Vec<RegistryEntry> {
        let (closed, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.conn.is_closed());
        self.entries = open;
        closed
    }

    /// Remove everything
    pub fn drain(&mut self) -> Vec<RegistryEntry> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn connection() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Connection::new(server).unwrap(), client)
    }

    #[tokio::test]
    async fn test_sweep_keeps_order() {
        let mut registry = Registry::new();
        let mut peers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (conn, peer) = connection().await;
            peers.push(peer);
            ids.push(registry.add(conn, ConnectionRole::Client(FollowerHandshake::new())));
        }

        registry.get_mut(ids[1]).unwrap().conn.mark_closed();
        let removed = registry.sweep();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].conn.id(), ids[1]);

        let remaining: Vec<ConnectionId> = registry.entries_mut().map(|e| e.conn.id()).collect();
        assert_eq!(remaining, vec![ids[0], ids[2]]);
    }

    #[tokio::test]
    async fn test_role_counts() {
        let mut registry = Registry::new();
        let (a, _pa) = connection().await;
        let (b, _pb) = connection().await;
        registry.add(a, ConnectionRole::Client(FollowerHandshake::new()));
        registry.add(b, ConnectionRole::Follower);
        assert_eq!(registry.role_counts(), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_blocked_clears_when_task_finishes() {
        let (conn, _peer) = connection().await;
        let mut entry = RegistryEntry::new(conn, ConnectionRole::Follower);
        entry.blocked_on = Some(tokio::spawn(async {}));
        for _ in 0..100 {
            if !entry.is_blocked() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert!(!entry.is_blocked());
        assert!(entry.blocked_on.is_none());
    }
}

//! Node Lifecycle
//!
//! Wires a node together: listener, snapshot load, replication state,
//! one ack coordinator, the accept and command loops, and for followers
//! the leader link.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::network::{AcceptLoop, Registry};
use crate::replication::{AckCoordinator, LeaderLink, LinkConfig, LinkStatus, ReplicationState, Role};
use crate::scheduler::CommandLoop;
use crate::store::rdb;

/// Node-wide shutdown flag
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the flag; every subscriber observes it
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Entry point for running a node
pub struct Node;

impl Node {
    /// Bind, load state and spawn all node tasks
    pub async fn start(config: RelayConfig) -> Result<NodeHandle> {
        config.validate()?;
        let config = Arc::new(config);

        let listen = config.listen_address();
        let listener = TcpListener::bind(&listen).await.map_err(|e| Error::ConnectionFailed {
            address: listen.clone(),
            reason: e.to_string(),
        })?;
        let local_addr = listener.local_addr()?;

        let snapshot_path = config.snapshot_path();
        let store = rdb::load_file(&snapshot_path)?;
        tracing::info!(path = %snapshot_path.display(), keys = store.len(), "Snapshot loaded");

        let leader = config.leader_address()?;
        let role = match &leader {
            Some((host, port)) => Role::Follower {
                host: host.clone(),
                port: *port,
            },
            None => Role::Leader,
        };
        let replication = Arc::new(ReplicationState::new(role));
        let coordinator = AckCoordinator::new();
        let shutdown = Shutdown::new();
        let (registry, registrations) = Registry::channel();

        tracing::info!(
            address = %local_addr,
            role = %replication.role(),
            replid = replication.replid(),
            "Starting node"
        );

        let command_loop = CommandLoop::new(
            config.clone(),
            store,
            registrations,
            replication.clone(),
            coordinator,
            shutdown.clone(),
        );
        let accept_loop = AcceptLoop::new(listener, registry.clone(), shutdown.subscribe());

        let tasks = vec![
            ("command-loop", tokio::spawn(command_loop.run())),
            ("accept-loop", tokio::spawn(accept_loop.run())),
        ];

        let mut link = None;
        let mut link_task = None;
        if let Some((host, port)) = leader {
            let link_config = LinkConfig {
                leader: format!("{}:{}", host, port),
                listening_port: local_addr.port(),
                connect_timeout: config.connect_timeout(),
                backoff: config.link_backoff(),
                ack_interval: config.ack_interval(),
            };
            match LeaderLink::connect(link_config, registry, replication.clone(), shutdown.subscribe()).await {
                Ok((connected, task)) => {
                    link = Some(connected);
                    link_task = Some(task);
                }
                Err(e) => {
                    // no reconnects: the node serves reads with the link down
                    tracing::error!(
                        leader = %host,
                        port,
                        transient = e.is_retryable(),
                        "Could not reach leader: {}",
                        e
                    );
                }
            }
        }

        Ok(NodeHandle {
            local_addr,
            replication,
            link,
            link_task,
            shutdown,
            tasks,
        })
    }
}

/// Handle to a running node
pub struct NodeHandle {
    local_addr: SocketAddr,
    replication: Arc<ReplicationState>,
    link: Option<LeaderLink>,
    link_task: Option<JoinHandle<()>>,
    shutdown: Shutdown,
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl NodeHandle {
    /// Address the listener actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn replication(&self) -> Arc<ReplicationState> {
        self.replication.clone()
    }

    /// Leader link progress (followers only)
    pub fn link_status(&self) -> Option<Arc<LinkStatus>> {
        self.link.as_ref().map(|link| link.status())
    }

    pub fn link(&self) -> Option<&LeaderLink> {
        self.link.as_ref()
    }

    /// Ask every task to stop
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_triggered() && self.tasks.iter().all(|(_, task)| !task.is_finished())
    }

    /// Wait for every task to finish
    pub async fn wait(self) -> Result<()> {
        let mut first_error = None;

        for (name, task) in self.tasks {
            match task.await {
                Ok(Ok(())) => tracing::debug!(task = name, "Task finished"),
                Ok(Err(e)) => {
                    tracing::error!(task = name, "Task failed: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(task = name, "Task panicked or was cancelled: {}", e);
                    first_error.get_or_insert(Error::Internal(format!("{} task: {}", name, e)));
                }
            }
        }
        if let Some(task) = self.link_task {
            let _ = task.await;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Trigger shutdown and wait for everything to stop
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        self.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> RelayConfig {
        let mut config = RelayConfig::default();
        config.node.port = 0;
        config.storage.dir = dir.to_path_buf();
        config
    }

    #[test]
    fn test_shutdown_flag() {
        let shutdown = Shutdown::new();
        let rx = shutdown.subscribe();
        assert!(!shutdown.is_triggered());
        shutdown.clone().trigger();
        assert!(shutdown.is_triggered());
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_start_and_stop_leader() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::start(test_config(dir.path())).await.unwrap();
        assert_ne!(node.local_addr().port(), 0);
        assert!(node.replication().is_leader());
        assert!(node.link_status().is_none());
        assert!(node.is_running());

        tokio::time::timeout(Duration::from_secs(5), node.stop())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_leader_leaves_link_down() {
        let dir = tempfile::tempdir().unwrap();
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let mut config = test_config(dir.path());
        config.replication.replicaof = Some(format!("127.0.0.1 {}", port));
        config.replication.connect_timeout_ms = 500;

        let node = Node::start(config).await.unwrap();
        assert!(!node.replication().is_leader());
        assert!(!node.replication().link_up());
        assert!(node.link_status().is_none());
        node.stop().await.unwrap();
    }
}

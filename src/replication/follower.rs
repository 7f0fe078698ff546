//! Leader Link (follower side)
//!
//! Owns the outbound connection to the leader. Work is a FIFO of
//! [`PendingRequest`]s: each sends one command and hands every reply to
//! its continuation, which says whether more replies belong to it. The
//! handshake is four such requests, each continuation queueing the next.
//!
//! Once PSYNC delivers the snapshot, the connection is handed to the
//! command loop, which applies the replication stream. The link keeps the
//! write half for REPLCONF ACKs and any later fire-and-forget commands.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::state::ReplicationState;
use crate::command::{Command, CommandKind, Replconf};
use crate::error::{Error, Result};
use crate::network::{connect_with_timeout, Connection, Registration, RegistryHandle, SharedWriter};
use crate::protocol::RespValue;
use crate::store::rdb;

/// What a continuation wants after seeing a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// This request is finished
    Done,
    /// Another regular value belongs to this request
    Value,
    /// A snapshot payload belongs to this request
    Snapshot,
}

type Continuation = Box<dyn FnMut(RespValue, &mut LinkContext) -> Result<Next> + Send>;

/// A command for the leader and the code that consumes its replies
pub struct PendingRequest {
    command: RespValue,
    continuation: Option<Continuation>,
}

impl PendingRequest {
    pub fn new<F>(command: RespValue, continuation: F) -> Self
    where
        F: FnMut(RespValue, &mut LinkContext) -> Result<Next> + Send + 'static,
    {
        Self {
            command,
            continuation: Some(Box::new(continuation)),
        }
    }

    /// A command whose replies, if any, are not read by the link
    pub fn fire_and_forget(command: RespValue) -> Self {
        Self {
            command,
            continuation: None,
        }
    }
}

/// State continuations may read and update
pub struct LinkContext {
    listening_port: u16,
    follow_ups: VecDeque<PendingRequest>,
    fullresync: Option<(String, u64)>,
    snapshot: Option<Bytes>,
    complete: bool,
}

impl LinkContext {
    fn new(listening_port: u16) -> Self {
        Self {
            listening_port,
            follow_ups: VecDeque::new(),
            fullresync: None,
            snapshot: None,
            complete: false,
        }
    }

    /// Queue a request ahead of anything submitted from outside
    pub fn enqueue(&mut self, request: PendingRequest) {
        self.follow_ups.push_back(request);
    }
}

/// Observable link progress
#[derive(Debug, Default)]
pub struct LinkStatus {
    handshake_complete: AtomicBool,
    snapshot_len: AtomicUsize,
    failed: AtomicBool,
}

impl LinkStatus {
    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete.load(Ordering::SeqCst)
    }

    /// Size of the snapshot received in FULLRESYNC
    pub fn snapshot_len(&self) -> usize {
        self.snapshot_len.load(Ordering::SeqCst)
    }

    /// The link hit an error and stopped
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Link settings
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub leader: String,
    /// Port this node actually listens on
    pub listening_port: u16,
    pub connect_timeout: Duration,
    pub backoff: Duration,
    pub ack_interval: Option<Duration>,
}

/// Handle to the running link
pub struct LeaderLink {
    requests: mpsc::UnboundedSender<PendingRequest>,
    status: Arc<LinkStatus>,
}

impl LeaderLink {
    /// Connect to the leader and start the processing task
    pub async fn connect(
        config: LinkConfig,
        registry: RegistryHandle,
        replication: Arc<ReplicationState>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let stream = connect_with_timeout(&config.leader, config.connect_timeout).await?;
        let conn = Connection::new(stream)?;
        tracing::info!(leader = %config.leader, "Connected to leader");

        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(LinkStatus::default());

        let task = LinkTask {
            writer: conn.writer(),
            conn: Some(conn),
            ctx: LinkContext::new(config.listening_port),
            config,
            requests: rx,
            registry,
            replication,
            status: status.clone(),
            shutdown,
        };

        let handle = tokio::spawn(async move {
            let leader = task.config.leader.clone();
            let status = task.status.clone();
            let replication = task.replication.clone();
            if let Err(e) = task.run().await {
                status.failed.store(true, Ordering::SeqCst);
                replication.set_link_up(false);
                tracing::error!(leader = %leader, "Leader link stopped: {}", e);
            }
        });

        Ok((
            Self {
                requests: tx,
                status,
            },
            handle,
        ))
    }

    /// Queue a command for the leader once the handshake is done
    pub fn send(&self, command: RespValue) -> Result<()> {
        if !self.status.handshake_complete() {
            return Err(Error::HandshakeIncomplete);
        }
        self.requests
            .send(PendingRequest::fire_and_forget(command))
            .map_err(|_| Error::Replication("leader link is not running".into()))
    }

    pub fn status(&self) -> Arc<LinkStatus> {
        self.status.clone()
    }
}

struct LinkTask {
    config: LinkConfig,
    /// Present until the handshake hands it to the command loop
    conn: Option<Connection>,
    writer: SharedWriter,
    ctx: LinkContext,
    requests: mpsc::UnboundedReceiver<PendingRequest>,
    registry: RegistryHandle,
    replication: Arc<ReplicationState>,
    status: Arc<LinkStatus>,
    shutdown: watch::Receiver<bool>,
}

impl LinkTask {
    async fn run(mut self) -> Result<()> {
        self.ctx.enqueue(ping_step());
        let mut next_ack: Option<Instant> = None;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let request = match self.ctx.follow_ups.pop_front() {
                Some(request) => Some(request),
                None => self.requests.try_recv().ok(),
            };

            match request {
                Some(request) => {
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        result = self.process(request) => result?,
                        _ = shutdown.changed() => break,
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.backoff) => {}
                        changed = self.shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }

            if self.ctx.complete && self.conn.is_some() {
                self.hand_off()?;
                next_ack = self.config.ack_interval.map(|every| Instant::now() + every);
            }

            if let (Some(at), Some(every)) = (next_ack, self.config.ack_interval) {
                if Instant::now() >= at {
                    send_ack(self.writer.clone(), self.replication.clone()).await?;
                    next_ack = Some(Instant::now() + every);
                }
            }
        }

        tracing::debug!("Leader link stopping on shutdown");
        Ok(())
    }

    async fn process(&mut self, request: PendingRequest) -> Result<()> {
        tracing::debug!(command = %request.command, "Sending to leader");
        self.writer.write(&request.command.to_bytes()).await?;

        let Some(mut continuation) = request.continuation else {
            return Ok(());
        };
        let conn = self.conn.as_mut().ok_or_else(|| {
            Error::Replication("replies after the handshake are read by the command loop".into())
        })?;

        let mut expect = Next::Value;
        loop {
            let reply = match expect {
                Next::Snapshot => RespValue::Snapshot(conn.read_snapshot().await?),
                _ => conn.read_value().await?.0,
            };
            expect = continuation(reply, &mut self.ctx)?;
            if expect == Next::Done {
                return Ok(());
            }
        }
    }

    /// Pass the connection and snapshot to the command loop
    fn hand_off(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let snapshot = self.ctx.snapshot.take().unwrap_or_default();
        let store = rdb::decode(&snapshot)?;

        // the stream continues the leader's count from the resync point
        let base = match self.ctx.fullresync.clone() {
            Some((replid, offset)) => {
                self.replication.set_leader_sync(replid, offset);
                offset
            }
            None => 0,
        };
        conn.set_offset(base);
        self.replication.set_processed_offset(base);
        self.replication.set_link_up(true);
        self.status.snapshot_len.store(snapshot.len(), Ordering::SeqCst);
        self.status.handshake_complete.store(true, Ordering::SeqCst);

        tracing::info!(
            leader = %self.config.leader,
            offset = base,
            snapshot_bytes = snapshot.len(),
            keys = store.len(),
            "Handshake complete, streaming from leader"
        );

        self.registry
            .register(Registration::Leader {
                conn,
                snapshot: store,
            })
            .map_err(|_| Error::ShuttingDown)
    }
}

/// Unsolicited ACK; the offset is sampled while holding the writer
async fn send_ack(writer: SharedWriter, replication: Arc<ReplicationState>) -> Result<()> {
    writer
        .write_with(move || {
            let offset = replication.processed_offset();
            Command::from(CommandKind::Replconf(Replconf::Ack(offset))).to_wire()
        })
        .await
}

fn expect_simple(reply: &RespValue, expected: &str, step: &str) -> Result<()> {
    match reply {
        RespValue::SimpleString(s) if s.eq_ignore_ascii_case(expected) => Ok(()),
        other => Err(Error::Protocol(format!(
            "{} expected +{}, got {}",
            step,
            expected,
            other.type_name()
        ))),
    }
}

fn ping_step() -> PendingRequest {
    PendingRequest::new(RespValue::command(&["PING"]), |reply, ctx| {
        expect_simple(&reply, "PONG", "PING")?;
        let port = ctx.listening_port;
        ctx.enqueue(listening_port_step(port));
        Ok(Next::Done)
    })
}

fn listening_port_step(port: u16) -> PendingRequest {
    let port = port.to_string();
    let command = RespValue::command(&["REPLCONF", "listening-port", port.as_str()]);
    PendingRequest::new(command, |reply, ctx| {
        expect_simple(&reply, "OK", "REPLCONF listening-port")?;
        ctx.enqueue(capa_step());
        Ok(Next::Done)
    })
}

fn capa_step() -> PendingRequest {
    PendingRequest::new(RespValue::command(&["REPLCONF", "capa", "psync2"]), |reply, ctx| {
        expect_simple(&reply, "OK", "REPLCONF capa")?;
        ctx.enqueue(psync_step());
        Ok(Next::Done)
    })
}

fn psync_step() -> PendingRequest {
    PendingRequest::new(RespValue::command(&["PSYNC", "?", "-1"]), |reply, ctx| {
        match reply {
            RespValue::SimpleString(line) if ctx.fullresync.is_none() => {
                ctx.fullresync = Some(parse_fullresync(&line)?);
                Ok(Next::Snapshot)
            }
            RespValue::Snapshot(data) if ctx.fullresync.is_some() => {
                ctx.snapshot = Some(data);
                ctx.complete = true;
                Ok(Next::Done)
            }
            other => Err(Error::Protocol(format!(
                "unexpected {} in reply to PSYNC",
                other.type_name()
            ))),
        }
    })
}

/// `FULLRESYNC <replid> <offset>`
fn parse_fullresync(line: &str) -> Result<(String, u64)> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(tag), Some(replid), Some(offset)) if tag.eq_ignore_ascii_case("FULLRESYNC") => {
            let offset = offset
                .parse::<u64>()
                .map_err(|_| Error::Protocol(format!("bad FULLRESYNC offset in '{}'", line)))?;
            Ok((replid.to_string(), offset))
        }
        _ => Err(Error::Protocol(format!("expected FULLRESYNC, got '{}'", line))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Registry;
    use crate::replication::Role;
    use crate::store::Store;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn link_config(addr: std::net::SocketAddr) -> LinkConfig {
        LinkConfig {
            leader: addr.to_string(),
            listening_port: 6380,
            connect_timeout: Duration::from_secs(1),
            backoff: Duration::from_millis(1),
            ack_interval: None,
        }
    }

    async fn expect_command(socket: &mut TcpStream, parts: &[&str]) {
        let expected = RespValue::command(parts).to_bytes();
        let mut buf = vec![0u8; expected.len()];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected.to_vec(), "expected {:?}", parts);
    }

    #[test]
    fn test_parse_fullresync() {
        let (id, offset) = parse_fullresync("FULLRESYNC abc123 42").unwrap();
        assert_eq!(id, "abc123");
        assert_eq!(offset, 42);
        assert!(parse_fullresync("CONTINUE").is_err());
    }

    #[tokio::test]
    async fn test_handshake_against_scripted_leader() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (registry, mut registrations) = Registry::channel();
        let replication = Arc::new(ReplicationState::new(Role::Follower {
            host: "127.0.0.1".into(),
            port: addr.port(),
        }));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let leader = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            expect_command(&mut socket, &["PING"]).await;
            socket.write_all(b"+PONG\r\n").await.unwrap();
            expect_command(&mut socket, &["REPLCONF", "listening-port", "6380"]).await;
            socket.write_all(b"+OK\r\n").await.unwrap();
            expect_command(&mut socket, &["REPLCONF", "capa", "psync2"]).await;
            socket.write_all(b"+OK\r\n").await.unwrap();
            expect_command(&mut socket, &["PSYNC", "?", "-1"]).await;

            let mut source = Store::new();
            source.set(Bytes::from("seed"), Bytes::from("1"), None);
            let snapshot = rdb::encode(&source);
            socket
                .write_all(format!("+FULLRESYNC {} 27\r\n", "a".repeat(40)).as_bytes())
                .await
                .unwrap();
            socket
                .write_all(&RespValue::Snapshot(snapshot).to_bytes())
                .await
                .unwrap();
            socket
        });

        let (link, _task) = LeaderLink::connect(link_config(addr), registry, replication.clone(), shutdown_rx)
            .await
            .unwrap();
        assert!(matches!(
            link.send(RespValue::command(&["PING"])),
            Err(Error::HandshakeIncomplete)
        ));

        let registration = tokio::time::timeout(Duration::from_secs(5), registrations.recv())
            .await
            .unwrap()
            .unwrap();
        let Registration::Leader { conn, mut snapshot } = registration else {
            panic!("expected the leader connection");
        };
        // offsets continue from the leader's position at the resync
        assert_eq!(conn.consumed(), 27);
        assert_eq!(replication.processed_offset(), 27);
        assert_eq!(snapshot.get(b"seed"), Some(Bytes::from("1")));
        assert!(link.status().handshake_complete());
        assert!(link.status().snapshot_len() > 0);
        assert!(replication.link_up());
        assert_eq!(replication.leader_sync(), Some(("a".repeat(40), 27)));

        let mut socket = leader.await.unwrap();
        link.send(RespValue::command(&["REPLCONF", "ACK", "0"])).unwrap();
        expect_command(&mut socket, &["REPLCONF", "ACK", "0"]).await;
    }

    #[tokio::test]
    async fn test_bad_psync_reply_fails_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (registry, _registrations) = Registry::channel();
        let replication = Arc::new(ReplicationState::new(Role::Follower {
            host: "127.0.0.1".into(),
            port: addr.port(),
        }));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"+PONG\r\n+OK\r\n+OK\r\n:7\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (link, task) = LeaderLink::connect(link_config(addr), registry, replication, shutdown_rx)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(link.status().failed());
        assert!(!link.status().handshake_complete());
    }
}

//! Command Loop
//!
//! The single polling scheduler. Each tick admits new connections, then
//! drains every complete value already buffered on every connection,
//! executes it and writes the reply. Replicated commands are forwarded
//! to streaming followers in the order they were applied. A tick that
//! found nothing to do sleeps for the idle backoff before the next one.
//!
//! This task alone touches the store and the fan-out list, so neither
//! needs a lock.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::command::{Command, CommandKind, ExecContext, Replconf};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::network::{ConnectionId, ConnectionRole, Registration, Registry, RegistryEntry};
use crate::node::Shutdown;
use crate::protocol::RespValue;
use crate::replication::{
    begin_wait, AckCoordinator, FollowerFanout, FollowerHandshake, HandshakeStep,
    ReplicationState, WaitOutcome, WaitSettings,
};
use crate::store::{rdb, Store};

/// Everything the loop needs to serve a connection
struct LoopCore {
    config: Arc<RelayConfig>,
    store: Store,
    replication: Arc<ReplicationState>,
    coordinator: AckCoordinator<ConnectionId>,
    fanout: FollowerFanout,
    wait_settings: WaitSettings,
    /// Followers to disconnect once the current pass over the registry ends
    evict: Vec<ConnectionId>,
    stop_requested: bool,
}

/// The command loop task
pub struct CommandLoop {
    registry: Registry,
    registrations: mpsc::UnboundedReceiver<Registration>,
    idle_backoff: Duration,
    shutdown: Shutdown,
    core: LoopCore,
}

impl CommandLoop {
    pub fn new(
        config: Arc<RelayConfig>,
        store: Store,
        registrations: mpsc::UnboundedReceiver<Registration>,
        replication: Arc<ReplicationState>,
        coordinator: AckCoordinator<ConnectionId>,
        shutdown: Shutdown,
    ) -> Self {
        let wait_settings = WaitSettings {
            grace: config.wait_grace(),
            max_dispatch: config.replication.max_ack_dispatch,
        };

        Self {
            registry: Registry::new(),
            registrations,
            idle_backoff: config.idle_backoff(),
            shutdown,
            core: LoopCore {
                config,
                store,
                replication,
                coordinator,
                fanout: FollowerFanout::new(),
                wait_settings,
                evict: Vec::new(),
                stop_requested: false,
            },
        }
    }

    /// Run until shutdown or a SHUTDOWN command
    pub async fn run(mut self) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        tracing::info!(role = %self.core.replication.role(), "Command loop started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let processed = self.tick().await;

            if self.core.stop_requested {
                tracing::info!("SHUTDOWN received, stopping node");
                self.shutdown.trigger();
                break;
            }

            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.idle_backoff) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        let (clients, followers, leader_links) = self.registry.role_counts();
        tracing::debug!(clients, followers, leader_links, "Closing connections");
        for mut entry in self.registry.drain() {
            self.core.forget(&entry);
            entry.conn.close().await;
        }
        tracing::info!("Command loop stopped");
        Ok(())
    }

    /// One pass over every connection; returns the number of commands handled
    async fn tick(&mut self) -> usize {
        self.admit();

        let mut processed = 0;
        for entry in self.registry.entries_mut() {
            // a closed leader link may still hold buffered stream data
            if entry.conn.is_closed() && !matches!(entry.role, ConnectionRole::Leader) {
                continue;
            }
            if entry.is_blocked() {
                continue;
            }
            processed += self.core.service(entry).await;
        }

        for id in std::mem::take(&mut self.core.evict) {
            if let Some(entry) = self.registry.get_mut(id) {
                entry.conn.mark_closed();
            }
        }

        for mut entry in self.registry.sweep() {
            self.core.forget(&entry);
            entry.conn.close().await;
            tracing::debug!(peer = %entry.conn.peer(), role = entry.role.name(), "Connection removed");
        }

        processed
    }

    fn admit(&mut self) {
        while let Ok(registration) = self.registrations.try_recv() {
            match registration {
                Registration::Client(conn) => {
                    self.registry
                        .add(conn, ConnectionRole::Client(FollowerHandshake::new()));
                }
                Registration::Leader { conn, snapshot } => {
                    tracing::info!(keys = snapshot.len(), "Loaded snapshot from leader");
                    self.core.store.replace(snapshot);
                    self.registry.add(conn, ConnectionRole::Leader);
                }
            }
        }
    }
}

impl LoopCore {
    /// Read and handle everything buffered on one connection
    async fn service(&mut self, entry: &mut RegistryEntry) -> usize {
        if let Err(e) = entry.conn.fill_available() {
            tracing::warn!(peer = %entry.conn.peer(), "Read failed: {}", e);
        }

        let mut processed = 0;
        loop {
            if entry.is_blocked() || self.stop_requested {
                break;
            }

            let (value, start) = match entry.conn.next_value() {
                Ok(Some(found)) => found,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(peer = %entry.conn.peer(), "Malformed input, closing: {}", e);
                    entry.conn.mark_closed();
                    break;
                }
            };
            processed += 1;

            let result = match entry.role {
                ConnectionRole::Client(_) => self.handle_client(entry, value, start).await,
                ConnectionRole::Follower => self.handle_follower(entry, value, start),
                ConnectionRole::Leader => self.handle_leader(entry, value, start).await,
            };

            if let Err(e) = result {
                if e.is_fatal_to_connection() {
                    tracing::warn!(
                        peer = %entry.conn.peer(),
                        role = entry.role.name(),
                        "Closing connection: {}",
                        e
                    );
                } else {
                    tracing::error!(peer = %entry.conn.peer(), "Command failed: {}", e);
                }
                entry.conn.mark_closed();
                break;
            }
        }
        processed
    }

    async fn handle_client(
        &mut self,
        entry: &mut RegistryEntry,
        value: RespValue,
        start: u64,
    ) -> Result<()> {
        let command = match Command::parse(value, start) {
            Ok(command) => command,
            Err(e) if e.is_client_error() => return reply(entry, RespValue::error(e.to_reply_message())).await,
            Err(e) => return Err(e),
        };
        tracing::debug!(peer = %entry.conn.peer(), command = command.name(), "Client command");

        let step = HandshakeStep::of(&command.kind);
        if self.replication.is_leader() {
            let peer = entry.conn.peer().to_string();
            if let ConnectionRole::Client(handshake) = &mut entry.role {
                handshake.advance(step, &peer)?;
            }
        } else if !matches!(step, HandshakeStep::Ping | HandshakeStep::Other) {
            return reply(entry, RespValue::error("ERR replica chaining is not supported")).await;
        }

        match &command.kind {
            CommandKind::Psync { .. } => self.full_resync(entry).await,
            CommandKind::Replconf(Replconf::ListeningPort(_) | Replconf::Capa(_)) => {
                reply(entry, RespValue::ok()).await
            }
            CommandKind::Replconf(_) => {
                reply(
                    entry,
                    RespValue::error("ERR REPLCONF GETACK and ACK are only valid on replication links"),
                )
                .await
            }
            CommandKind::Wait { replicas, timeout } => {
                if !self.replication.is_leader() {
                    return reply(
                        entry,
                        RespValue::error("ERR WAIT cannot be used with replica instances"),
                    )
                    .await;
                }
                self.wait(entry, *replicas, *timeout).await
            }
            CommandKind::Shutdown => {
                self.stop_requested = true;
                reply(entry, RespValue::ok()).await
            }
            _ if command.is_replicated() && !self.replication.is_leader() => {
                reply(entry, RespValue::error(Error::ReadOnly.to_reply_message())).await
            }
            _ => {
                let outcome = command.execute(&mut ExecContext {
                    store: &mut self.store,
                    config: &self.config,
                    replication: &self.replication,
                });
                match outcome {
                    Ok(Some(value)) => reply(entry, value).await?,
                    Ok(None) => {}
                    Err(e) if e.is_client_error() => {
                        return reply(entry, RespValue::error(e.to_reply_message())).await;
                    }
                    Err(e) => return Err(e),
                }
                if command.is_replicated() {
                    self.propagate(&command).await;
                }
                Ok(())
            }
        }
    }

    /// Handshake-complete followers only send REPLCONF ACK
    fn handle_follower(&mut self, entry: &mut RegistryEntry, value: RespValue, start: u64) -> Result<()> {
        let id = entry.conn.id();
        let command = match Command::parse(value, start) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(follower = %id, "Ignoring unparsable input from follower: {}", e);
                return Ok(());
            }
        };

        match command.kind {
            CommandKind::Replconf(Replconf::Ack(offset)) => {
                self.replication.record_ack(id, offset)?;
                self.coordinator.signal_at(&id, offset);
                Ok(())
            }
            other => {
                tracing::debug!(follower = %id, command = ?other, "Ignoring non-ACK command from follower");
                Ok(())
            }
        }
    }

    /// Apply the leader's replication stream; only GETACK is answered
    async fn handle_leader(&mut self, entry: &mut RegistryEntry, value: RespValue, start: u64) -> Result<()> {
        let result = match Command::parse(value, start) {
            Ok(command) => self.apply_from_leader(entry, command).await,
            Err(e) if e.is_client_error() => {
                tracing::warn!("Skipping unparsable command from leader: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.replication.set_processed_offset(entry.conn.consumed());
        result
    }

    async fn apply_from_leader(&mut self, entry: &mut RegistryEntry, command: Command) -> Result<()> {
        match &command.kind {
            CommandKind::Replconf(Replconf::GetAck) => {
                let ack = Command::from(CommandKind::Replconf(Replconf::Ack(command.start_offset)));
                entry.conn.writer().write(&ack.to_wire()).await
            }
            CommandKind::Ping(_) => Ok(()),
            CommandKind::Replconf(_)
            | CommandKind::Psync { .. }
            | CommandKind::Wait { .. }
            | CommandKind::Shutdown => {
                tracing::debug!(command = command.name(), "Ignoring command from leader");
                Ok(())
            }
            _ => {
                let outcome = command.execute(&mut ExecContext {
                    store: &mut self.store,
                    config: &self.config,
                    replication: &self.replication,
                });
                if let Err(e) = outcome {
                    tracing::warn!(command = command.name(), "Replicated command failed: {}", e);
                }
                Ok(())
            }
        }
    }

    /// Answer PSYNC: FULLRESYNC line, snapshot, then streaming
    async fn full_resync(&mut self, entry: &mut RegistryEntry) -> Result<()> {
        let id = entry.conn.id();
        let peer = entry.conn.peer();
        let listening_port = match &entry.role {
            ConnectionRole::Client(handshake) => handshake.listening_port(),
            _ => None,
        };

        let snapshot = rdb::encode(&self.store);
        let offset = self.replication.offset();
        let header = RespValue::simple(format!(
            "FULLRESYNC {} {}",
            self.replication.replid(),
            offset
        ));

        let writer = entry.conn.writer();
        writer.write(&header.to_bytes()).await?;
        writer.write(&RespValue::Snapshot(snapshot.clone()).to_bytes()).await?;

        entry.role = ConnectionRole::Follower;
        self.replication.add_follower(id, peer, listening_port);
        self.fanout.add(id, writer);
        tracing::info!(peer = %peer, offset, snapshot_bytes = snapshot.len(), "Full resync sent");
        Ok(())
    }

    async fn wait(&mut self, entry: &mut RegistryEntry, replicas: usize, timeout: Duration) -> Result<()> {
        let (outcome, dropped) = begin_wait(
            replicas,
            timeout,
            &self.replication,
            &self.coordinator,
            &mut self.fanout,
            &self.wait_settings,
        )
        .await;
        self.evict.extend(dropped);

        match outcome {
            WaitOutcome::Ready(count) => reply(entry, RespValue::Integer(count as i64)).await,
            WaitOutcome::Pending(pending) => {
                let writer = entry.conn.writer();
                let peer = entry.conn.peer();
                entry.blocked_on = Some(tokio::spawn(async move {
                    let count = pending.await;
                    tracing::debug!(peer = %peer, count, "WAIT resolved");
                    if let Err(e) = writer.write(&RespValue::Integer(count as i64).to_bytes()).await {
                        tracing::debug!(peer = %peer, "Could not deliver WAIT reply: {}", e);
                    }
                }));
                Ok(())
            }
        }
    }

    async fn propagate(&mut self, command: &Command) {
        if self.fanout.is_empty() {
            return;
        }
        let wire = command.to_wire();
        let dropped = self.fanout.propagate(&wire).await;
        let offset = self.replication.advance_offset(wire.len() as u64);
        tracing::trace!(command = command.name(), offset, "Propagated");
        self.evict.extend(dropped);
    }

    /// Drop replication bookkeeping for a departing connection
    fn forget(&mut self, entry: &RegistryEntry) {
        match entry.role {
            ConnectionRole::Follower => {
                let id = entry.conn.id();
                self.fanout.remove(id);
                self.replication.remove_follower(id);
            }
            ConnectionRole::Leader => {
                self.replication.set_link_up(false);
                tracing::warn!(peer = %entry.conn.peer(), "Lost connection to leader");
            }
            ConnectionRole::Client(_) => {}
        }
        if let Some(handle) = &entry.blocked_on {
            handle.abort();
        }
    }
}

async fn reply(entry: &RegistryEntry, value: RespValue) -> Result<()> {
    entry.conn.send(&value).await
}

//! Accept Loop
//!
//! Single task bound to the listening socket. Each accepted socket is
//! wrapped as a [`Connection`] and handed to the command loop.

use tokio::net::TcpListener;
use tokio::sync::watch;

use super::connection::Connection;
use super::registry::{Registration, RegistryHandle};
use crate::error::Result;

/// Accepts inbound connections until shutdown
pub struct AcceptLoop {
    listener: TcpListener,
    registry: RegistryHandle,
    shutdown: watch::Receiver<bool>,
}

impl AcceptLoop {
    pub fn new(
        listener: TcpListener,
        registry: RegistryHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            registry,
            shutdown,
        }
    }

    /// Run until the shutdown flag is raised; the listener is dropped on return
    pub async fn run(mut self) -> Result<()> {
        let local = self.listener.local_addr()?;
        tracing::info!("Accepting connections on {}", local);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let conn = match Connection::new(socket) {
                                Ok(conn) => conn,
                                Err(e) => {
                                    tracing::warn!(peer = %addr, "Failed to set up connection: {}", e);
                                    continue;
                                }
                            };
                            tracing::debug!(peer = %addr, id = %conn.id(), "Accepted connection");

                            if self.registry.register(Registration::Client(conn)).is_err() {
                                tracing::debug!("Command loop gone, stopping accept loop");
                                break;
                            }
                        }
                        Err(e) => {
                            if *self.shutdown.borrow() {
                                tracing::debug!("Accept failed during shutdown: {}", e);
                                break;
                            }
                            tracing::warn!("Accept error: {}", e);
                        }
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Accept loop on {} stopped", local);
        Ok(())
    }
}

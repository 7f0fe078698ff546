//! Network Module
//!
//! Sockets, the connection registry and the accept loop.

pub mod client;
pub mod connection;
pub mod registry;
pub mod server;

pub use client::{connect_with_timeout, RespClient};
pub use connection::{Connection, ConnectionId, SharedWriter};
pub use registry::{ConnectionRole, Registration, Registry, RegistryEntry, RegistryHandle};
pub use server::AcceptLoop;

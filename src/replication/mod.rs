//! Replication Module
//!
//! Leader-side handshake tracking, fan-out and WAIT; the follower-side
//! leader link; the ack coordinator both sides of WAIT meet at; and the
//! per-node replication counters.

pub mod coordinator;
pub mod follower;
pub mod handshake;
pub mod leader;
pub mod state;

pub use coordinator::{AckCoordinator, WaitTicket};
pub use follower::{LeaderLink, LinkConfig, LinkContext, LinkStatus, Next, PendingRequest};
pub use handshake::{FollowerHandshake, HandshakeState, HandshakeStep};
pub use leader::{begin_wait, FollowerFanout, WaitOutcome, WaitSettings};
pub use state::{generate_replid, FollowerRecord, ReplicationState, Role};

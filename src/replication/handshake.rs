//! Follower Handshake (leader side)
//!
//! Tracks how far a connection has come through
//! PING, REPLCONF listening-port, REPLCONF capa, PSYNC.

use crate::command::{CommandKind, Replconf};
use crate::error::{Error, Result};

/// Handshake progress of one inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingPing,
    AwaitingReplconfPort,
    AwaitingReplconfCapa,
    AwaitingPsync,
    Complete,
}

impl HandshakeState {
    fn expected(&self) -> &'static str {
        match self {
            HandshakeState::AwaitingPing => "PING",
            HandshakeState::AwaitingReplconfPort => "REPLCONF listening-port",
            HandshakeState::AwaitingReplconfCapa => "REPLCONF capa",
            HandshakeState::AwaitingPsync => "PSYNC",
            HandshakeState::Complete => "REPLCONF ACK",
        }
    }
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeState::AwaitingPing => write!(f, "awaiting-ping"),
            HandshakeState::AwaitingReplconfPort => write!(f, "awaiting-replconf-port"),
            HandshakeState::AwaitingReplconfCapa => write!(f, "awaiting-replconf-capa"),
            HandshakeState::AwaitingPsync => write!(f, "awaiting-psync"),
            HandshakeState::Complete => write!(f, "complete"),
        }
    }
}

/// The part of a command that matters to the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Ping,
    ListeningPort(u16),
    Capa,
    Psync,
    /// Any command outside the handshake
    Other,
}

impl HandshakeStep {
    pub fn of(kind: &CommandKind) -> Self {
        match kind {
            CommandKind::Ping(_) => HandshakeStep::Ping,
            CommandKind::Replconf(Replconf::ListeningPort(port)) => {
                HandshakeStep::ListeningPort(*port)
            }
            CommandKind::Replconf(Replconf::Capa(_)) => HandshakeStep::Capa,
            CommandKind::Psync { .. } => HandshakeStep::Psync,
            _ => HandshakeStep::Other,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            HandshakeStep::Ping => "PING",
            HandshakeStep::ListeningPort(_) => "REPLCONF listening-port",
            HandshakeStep::Capa => "REPLCONF capa",
            HandshakeStep::Psync => "PSYNC",
            HandshakeStep::Other => "a regular command",
        }
    }
}

/// Per-connection handshake tracker
///
/// A connection that never starts the handshake is an ordinary client:
/// regular commands are fine before PING and right after it. Once
/// REPLCONF listening-port has been seen, only the remaining handshake
/// steps are accepted, in order.
#[derive(Debug, Clone)]
pub struct FollowerHandshake {
    state: HandshakeState,
    listening_port: Option<u16>,
}

impl Default for FollowerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl FollowerHandshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::AwaitingPing,
            listening_port: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn listening_port(&self) -> Option<u16> {
        self.listening_port
    }

    pub fn is_complete(&self) -> bool {
        self.state == HandshakeState::Complete
    }

    /// Apply one command; an out-of-order step is a violation
    ///
    /// PING and regular commands are accepted before REPLCONF, and extra
    /// `capa` lines before PSYNC. Neither moves the state.
    pub fn advance(&mut self, step: HandshakeStep, peer: &str) -> Result<HandshakeState> {
        use HandshakeState::*;

        let next = match (self.state, step) {
            (AwaitingPing, HandshakeStep::Ping) => AwaitingReplconfPort,
            (AwaitingPing, HandshakeStep::Other) => AwaitingPing,
            (AwaitingReplconfPort, HandshakeStep::Ping) => AwaitingReplconfPort,
            (AwaitingReplconfPort, HandshakeStep::Other) => AwaitingReplconfPort,
            (AwaitingReplconfPort, HandshakeStep::ListeningPort(port)) => {
                self.listening_port = Some(port);
                AwaitingReplconfCapa
            }
            (AwaitingReplconfCapa, HandshakeStep::Capa) => AwaitingPsync,
            (AwaitingPsync, HandshakeStep::Capa) => AwaitingPsync,
            (AwaitingPsync, HandshakeStep::Psync) => Complete,
            (state, step) => {
                return Err(Error::HandshakeViolation {
                    peer: peer.to_string(),
                    expected: state.expected(),
                    received: step.name().to_string(),
                });
            }
        };

        if next != self.state {
            tracing::debug!(peer = %peer, from = %self.state, to = %next, "Handshake advanced");
        }
        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "127.0.0.1:4000";

    #[test]
    fn test_full_sequence() {
        let mut hs = FollowerHandshake::new();
        assert_eq!(hs.advance(HandshakeStep::Ping, PEER).unwrap(), HandshakeState::AwaitingReplconfPort);
        assert_eq!(
            hs.advance(HandshakeStep::ListeningPort(6380), PEER).unwrap(),
            HandshakeState::AwaitingReplconfCapa
        );
        assert_eq!(hs.advance(HandshakeStep::Capa, PEER).unwrap(), HandshakeState::AwaitingPsync);
        assert_eq!(hs.advance(HandshakeStep::Capa, PEER).unwrap(), HandshakeState::AwaitingPsync);
        assert!(!hs.is_complete());
        assert_eq!(hs.advance(HandshakeStep::Psync, PEER).unwrap(), HandshakeState::Complete);
        assert!(hs.is_complete());
        assert_eq!(hs.listening_port(), Some(6380));
    }

    #[test]
    fn test_ordinary_client_stays_put() {
        let mut hs = FollowerHandshake::new();
        hs.advance(HandshakeStep::Other, PEER).unwrap();
        hs.advance(HandshakeStep::Ping, PEER).unwrap();
        hs.advance(HandshakeStep::Ping, PEER).unwrap();
        hs.advance(HandshakeStep::Other, PEER).unwrap();
        assert_eq!(hs.state(), HandshakeState::AwaitingReplconfPort);
    }

    #[test]
    fn test_out_of_order_is_violation() {
        let mut hs = FollowerHandshake::new();
        assert!(matches!(
            hs.advance(HandshakeStep::Psync, PEER),
            Err(Error::HandshakeViolation { expected: "PING", .. })
        ));

        let mut hs = FollowerHandshake::new();
        hs.advance(HandshakeStep::Ping, PEER).unwrap();
        hs.advance(HandshakeStep::ListeningPort(1), PEER).unwrap();
        assert!(hs.advance(HandshakeStep::ListeningPort(2), PEER).is_err());
        assert!(hs.advance(HandshakeStep::Other, PEER).is_err());
        assert!(hs.advance(HandshakeStep::Psync, PEER).is_err());
        assert_eq!(hs.listening_port(), Some(1));
    }

    #[test]
    fn test_complete_accepts_nothing_but_acks() {
        let mut hs = FollowerHandshake::new();
        for step in [
            HandshakeStep::Ping,
            HandshakeStep::ListeningPort(1),
            HandshakeStep::Capa,
            HandshakeStep::Psync,
        ] {
            hs.advance(step, PEER).unwrap();
        }
        assert!(hs.advance(HandshakeStep::Ping, PEER).is_err());
    }
}

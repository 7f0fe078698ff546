//! RelayKV Error Types

use thiserror::Error;

/// Result type alias for RelayKV operations
pub type Result<T> = std::result::Result<T, Error>;

/// RelayKV error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to render configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    InvalidCommand(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("WRONGTYPE {0}")]
    WrongType(String),

    #[error("READONLY You can't write against a read only replica.")]
    ReadOnly,

    // Replication errors
    #[error("Handshake violation from {peer}: expected {expected}, got {received}")]
    HandshakeViolation {
        peer: String,
        expected: &'static str,
        received: String,
    },

    #[error("Handshake with leader is not complete")]
    HandshakeIncomplete,

    #[error("Acknowledged offset regressed for {follower}: {reported} < {previous}")]
    AckRegression {
        follower: String,
        previous: u64,
        reported: u64,
    },

    #[error("Replication error: {0}")]
    Replication(String),

    // Snapshot errors
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error should close the connection it happened on
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::HandshakeViolation { .. }
                | Error::AckRegression { .. }
                | Error::ConnectionClosed
                | Error::Io(_)
        )
    }

    /// Check if this error is reported to the client as an error reply
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidCommand(_)
                | Error::UnknownCommand(_)
                | Error::WrongType(_)
                | Error::ReadOnly
        )
    }

    /// Render as the payload of a protocol error reply
    pub fn to_reply_message(&self) -> String {
        match self {
            Error::WrongType(_) | Error::ReadOnly => self.to_string(),
            other => format!("ERR {}", other),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_) | Error::ConnectionFailed { .. } | Error::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_messages() {
        let err = Error::UnknownCommand("FLY".into());
        assert_eq!(err.to_reply_message(), "ERR unknown command 'FLY'");
        assert!(err.is_client_error());

        assert!(Error::ReadOnly.to_reply_message().starts_with("READONLY"));
        assert!(!Error::ConnectionClosed.is_client_error());
        assert!(Error::ConnectionClosed.is_fatal_to_connection());
    }
}

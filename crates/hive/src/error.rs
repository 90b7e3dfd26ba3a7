//! Error types for the Hive control plane

use hive_proto::ProtocolError;
use std::time::Duration;
use thiserror::Error;

use crate::{SessionId, TunnelId};

/// Main error type for Hive operations
#[derive(Debug, Error)]
pub enum HiveError {
    /// No reply arrived before the caller's deadline
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// Tunnel id is not registered
    #[error("Invalid tunnel ID: {0}")]
    InvalidTunnelId(TunnelId),

    /// Session id is not registered
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Outbound push did not complete within the configured send timeout
    #[error("Transport unavailable for session {session_id} after {waited:?}")]
    TransportUnavailable {
        /// Session whose transport stalled
        session_id: SessionId,
        /// Time spent waiting on the outbound channel
        waited: Duration,
    },

    /// The transport write loop dropped the outbound channel
    #[error("Transport closed for session {0}")]
    TransportClosed(SessionId),

    /// The session dropped the reply channel of a pending request
    #[error("Session {0} closed before replying")]
    SessionClosed(SessionId),

    /// Tunnel end is closed
    #[error("Tunnel {0} closed")]
    TunnelClosed(TunnelId),

    /// Tunnel buffer is full and the chunk could not be queued
    #[error("Tunnel {0} buffer full")]
    TunnelFull(TunnelId),

    /// Every session id has been handed out
    #[error("Session ids exhausted")]
    SessionIdsExhausted,

    /// Framing or decoding errors
    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    /// Transport I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for HiveError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::Io(e),
            ProtocolError::Serialization(msg) => Self::Serialization(msg),
            other => Self::Protocol(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_transport_failure_surfaces_as_io() {
        let broken = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        let err = HiveError::from(ProtocolError::Io(broken));
        assert!(matches!(err, HiveError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_decode_failure_stays_distinct() {
        let err = HiveError::from(ProtocolError::Serialization("bad map".to_string()));
        assert!(matches!(err, HiveError::Serialization(ref msg) if msg == "bad map"));

        let err = HiveError::from(ProtocolError::UnknownMessageType(99));
        assert!(matches!(err, HiveError::Protocol(ProtocolError::UnknownMessageType(99))));
    }
}

//! Envelope structure and message types

use serde::{Deserialize, Serialize};
use bytes::Bytes;
use crate::ProtocolError;

/// Correlation id carried by envelopes that answer no request
pub const UNSOLICITED_ID: u64 = 0;

/// Message types understood by server and agents
///
/// Encoded as a `u32` on the wire. Decoding an integer outside this set
/// fails with [`ProtocolError::UnknownMessageType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(u32)]
pub enum MsgType {
    /// Agent registration
    Register = 1,
    /// Liveness probe
    Ping = 2,
    /// Ask the agent to terminate
    Kill = 3,
    /// Opaque operator task
    Task = 4,
    /// Bytes relayed through a tunnel
    TunnelData = 5,
    /// Tunnel teardown notice
    TunnelClose = 6,
}

impl TryFrom<u32> for MsgType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MsgType::Register),
            2 => Ok(MsgType::Ping),
            3 => Ok(MsgType::Kill),
            4 => Ok(MsgType::Task),
            5 => Ok(MsgType::TunnelData),
            6 => Ok(MsgType::TunnelClose),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

impl From<MsgType> for u32 {
    fn from(value: MsgType) -> Self {
        value as u32
    }
}

/// Logical unit of communication with an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id, [`UNSOLICITED_ID`] when not tied to a request
    pub id: u64,
    /// Message type
    pub msg_type: MsgType,
    /// Opaque payload
    pub data: Bytes,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(id: u64, msg_type: MsgType, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            msg_type,
            data: data.into(),
        }
    }

    /// Create an envelope that answers no request
    pub fn unsolicited(msg_type: MsgType, data: impl Into<Bytes>) -> Self {
        Self::new(UNSOLICITED_ID, msg_type, data)
    }

    /// Build the reply to this envelope, reusing its correlation id
    pub fn reply(&self, data: impl Into<Bytes>) -> Self {
        Self::new(self.id, self.msg_type, data)
    }

    /// Check whether this envelope is tied to a pending request
    pub fn is_correlated(&self) -> bool {
        self.id != UNSOLICITED_ID
    }

    /// Serialize envelope to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize envelope from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_msg_type_wire_values() {
        assert_eq!(u32::from(MsgType::Register), 1);
        assert_eq!(u32::from(MsgType::TunnelClose), 6);
        assert_eq!(MsgType::try_from(5).unwrap(), MsgType::TunnelData);
    }

    #[test]
    fn test_unknown_msg_type() {
        let result = MsgType::try_from(0);
        assert!(matches!(result, Err(ProtocolError::UnknownMessageType(0))));

        let result = MsgType::try_from(99);
        assert!(matches!(result, Err(ProtocolError::UnknownMessageType(99))));
    }

    #[test]
    fn test_envelope_correlation() {
        let request = Envelope::new(42, MsgType::Ping, Bytes::from_static(b"ping"));
        assert!(request.is_correlated());

        let reply = request.reply(Bytes::from_static(b"pong"));
        assert_eq!(reply.id, 42);
        assert_eq!(reply.msg_type, MsgType::Ping);
        assert_eq!(reply.data, Bytes::from_static(b"pong"));

        let notice = Envelope::unsolicited(MsgType::Register, Bytes::new());
        assert!(!notice.is_correlated());
        assert_eq!(notice.id, UNSOLICITED_ID);
    }

    #[test]
    fn test_envelope_with_unknown_type_rejected() {
        // Same layout as Envelope, but with a raw integer type
        #[derive(Serialize)]
        struct RawEnvelope {
            id: u64,
            msg_type: u32,
            data: Bytes,
        }

        let raw = RawEnvelope { id: 1, msg_type: 1000, data: Bytes::new() };
        let bytes = rmp_serde::to_vec(&raw).unwrap();

        assert!(Envelope::from_msgpack(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn test_envelope_payload_preserved(
            id in any::<u64>(),
            payload in prop::collection::vec(any::<u8>(), 0..1024)
        ) {
            let envelope = Envelope::new(id, MsgType::TunnelData, payload.clone());
            let decoded = Envelope::from_msgpack(&envelope.to_msgpack().unwrap()).unwrap();

            prop_assert_eq!(decoded.id, id);
            prop_assert_eq!(decoded.data.as_ref(), payload.as_slice());
        }
    }
}

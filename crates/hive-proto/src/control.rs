//! Control messages carried inside envelopes

use serde::{Deserialize, Serialize};
use bytes::Bytes;
use crate::{Envelope, MsgType, ProtocolError};

/// Asks the peer to release its side of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelClose {
    /// Tunnel being torn down
    pub tunnel_id: u64,
    /// Session the tunnel rides on
    pub session_id: u32,
}

impl TunnelClose {
    /// Create a new close notice
    pub fn new(tunnel_id: u64, session_id: u32) -> Self {
        Self { tunnel_id, session_id }
    }

    /// Wrap this notice in an uncorrelated [`MsgType::TunnelClose`] envelope
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let payload = rmp_serde::to_vec(self)?;
        Ok(Envelope::unsolicited(MsgType::TunnelClose, payload))
    }

    /// Decode a notice from an envelope payload
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(payload)?)
    }
}

/// Chunk of tunneled bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelData {
    /// Tunnel the bytes belong to
    pub tunnel_id: u64,
    /// Session the tunnel rides on
    pub session_id: u32,
    /// Opaque tunneled bytes
    pub data: Bytes,
    /// Sender has no more data for this tunnel
    pub closed: bool,
}

impl TunnelData {
    /// Create a data chunk
    pub fn new(tunnel_id: u64, session_id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            tunnel_id,
            session_id,
            data: data.into(),
            closed: false,
        }
    }

    /// Create the final, empty chunk of a tunnel
    pub fn closing(tunnel_id: u64, session_id: u32) -> Self {
        Self {
            tunnel_id,
            session_id,
            data: Bytes::new(),
            closed: true,
        }
    }

    /// Wrap this chunk in an uncorrelated [`MsgType::TunnelData`] envelope
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let payload = rmp_serde::to_vec(self)?;
        Ok(Envelope::unsolicited(MsgType::TunnelData, payload))
    }

    /// Decode a chunk from an envelope payload
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(payload)?)
    }
}

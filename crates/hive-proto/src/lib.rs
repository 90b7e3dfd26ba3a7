//! # Hive Protocol
//!
//! Envelope model, control messages and codec spoken between the Hive
//! server and its agents.

#![warn(missing_docs)]

/// Envelope structure and message types
pub mod envelope;

/// Control messages carried inside envelopes
pub mod control;

/// Envelope codec for async streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use envelope::{Envelope, MsgType, UNSOLICITED_ID};
pub use control::{TunnelClose, TunnelData};
pub use codec::{EnvelopeCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;

//! # Hive
//!
//! In-memory control plane for a server managing many connected agents.
//!
//! Hive keeps the directory of live agent sessions, turns each session's
//! multiplexed envelope stream into request/response calls matched by
//! correlation id, and relays opaque bytes between console clients and
//! agents through tunnels.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use hive_proto as proto;

/// Error types for the Hive control plane
pub mod error;

/// Runtime configuration
pub mod config;

/// Identifier generation
pub mod ids;

/// Session lifecycle events
pub mod event;

/// Live agent connections and request correlation
pub mod session;

/// Directory of live sessions
pub mod registry;

/// Duplex tunnels
pub mod tunnel;

/// Transport pump driving a session over a byte stream
pub mod pump;

/// Process-wide control plane handle
pub mod hive;

pub use error::HiveError;
pub use config::HiveConfig;
pub use ids::{EnvelopeIdGenerator, SessionIdGenerator};
pub use event::{Event, EventBroker, EventPublisher};
pub use session::{Delivery, Session, SessionDescriptor, SessionInfo};
pub use registry::SessionRegistry;
pub use tunnel::{Tunnel, TunnelEnd, TunnelRegistry, TunnelState};
pub use pump::{spawn_tunnel_relay, ConnectionHandler};
pub use hive::Hive;

/// Session identifier
pub type SessionId = u32;

/// Tunnel identifier
pub type TunnelId = u64;

/// Result type alias for Hive operations
pub type Result<T> = std::result::Result<T, HiveError>;

//! Identifier generation

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::{SessionId, TunnelId};
use hive_proto::UNSOLICITED_ID;

/// Hands out strictly increasing session ids
///
/// Ids never repeat: once `u32::MAX` has been handed out the generator is
/// exhausted and returns `None`.
#[derive(Debug)]
pub struct SessionIdGenerator {
    last: AtomicU32,
}

impl SessionIdGenerator {
    /// Create a generator whose first id is `start + 1`
    pub fn new(start: u32) -> Self {
        Self {
            last: AtomicU32::new(start),
        }
    }

    /// Allocate the next session id
    pub fn next_id(&self) -> Option<SessionId> {
        self.last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| last.checked_add(1))
            .ok()
            .map(|last| last + 1)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Process-wide correlation id source
///
/// One instance is shared by every session so that ids stay unique across
/// the whole transport, not just within one connection.
#[derive(Debug)]
pub struct EnvelopeIdGenerator {
    next: AtomicU64,
}

impl EnvelopeIdGenerator {
    /// Create a generator starting at 1
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next correlation id, never [`UNSOLICITED_ID`]
    pub fn next_id(&self) -> u64 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != UNSOLICITED_ID {
                return id;
            }
        }
    }
}

impl Default for EnvelopeIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Draw a tunnel id from the operating system's secure random source
pub fn new_tunnel_id() -> TunnelId {
    OsRng.next_u64()
}

//! Runtime configuration

use std::time::Duration;

/// Tunables shared by every component of a [`Hive`](crate::Hive)
#[derive(Debug, Clone)]
pub struct HiveConfig {
    /// Capacity of each session's outbound envelope channel
    pub outbound_capacity: usize,
    /// Upper bound on a single outbound push; `None` waits for the transport forever
    pub send_timeout: Option<Duration>,
    /// Timeout used by [`Session::call`](crate::Session::call)
    pub request_timeout: Duration,
    /// Number of chunks buffered in each direction of a tunnel
    pub tunnel_buffer: usize,
    /// Session ids are handed out starting at `session_id_start + 1`
    pub session_id_start: u32,
    /// Capacity of the lifecycle event broadcast channel
    pub event_capacity: usize,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            send_timeout: Some(Duration::from_secs(30)),
            request_timeout: Duration::from_secs(60),
            tunnel_buffer: 32,
            session_id_start: 0,
            event_capacity: 1024,
        }
    }
}

impl HiveConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set outbound channel capacity (clamped to at least one slot)
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Set or disable the outbound push timeout
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the default request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the per-direction tunnel buffer (clamped to at least one chunk)
    pub fn with_tunnel_buffer(mut self, chunks: usize) -> Self {
        self.tunnel_buffer = chunks.max(1);
        self
    }

    /// Set the session id counter start
    pub fn with_session_id_start(mut self, start: u32) -> Self {
        self.session_id_start = start;
        self
    }

    /// Set the event channel capacity (clamped to at least one event)
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

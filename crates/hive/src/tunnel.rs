//! Duplex tunnels between console clients and sessions

use crate::ids::new_tunnel_id;
use crate::{HiveConfig, HiveError, Result, Session, SessionId, SessionRegistry, TunnelId};
use bytes::Bytes;
use hive_proto::TunnelClose;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a tunnel
///
/// A tunnel is usable for relaying as soon as it is created, so there is no
/// separate pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Both ends relay bytes
    Active,
    /// The client end was closed
    Closed,
}

/// One side of a tunnel
///
/// Bytes sent on one end are received on the opposite end. Closing an end
/// makes its own `send` fail and its own `recv` return `None`; the opposite
/// end drains what was already buffered, then sees end-of-stream on `recv`
/// and [`HiveError::TunnelClosed`] on `send`.
pub struct TunnelEnd {
    tunnel_id: TunnelId,
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    closed: CancellationToken,
    peer_closed: CancellationToken,
}

impl TunnelEnd {
    /// Send a chunk to the opposite end, waiting while its buffer is full
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        if self.closed.is_cancelled() || self.peer_closed.is_cancelled() {
            return Err(HiveError::TunnelClosed(self.tunnel_id));
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(HiveError::TunnelClosed(self.tunnel_id)),
            _ = self.peer_closed.cancelled() => Err(HiveError::TunnelClosed(self.tunnel_id)),
            sent = self.tx.send(data) => sent.map_err(|_| HiveError::TunnelClosed(self.tunnel_id)),
        }
    }

    /// Queue a chunk for the opposite end without waiting
    ///
    /// Fails with [`HiveError::TunnelFull`] when the opposite end has not
    /// drained its buffer.
    pub fn try_send(&self, data: impl Into<Bytes>) -> Result<()> {
        if self.closed.is_cancelled() || self.peer_closed.is_cancelled() {
            return Err(HiveError::TunnelClosed(self.tunnel_id));
        }

        self.tx.try_send(data.into()).map_err(|e| match e {
            TrySendError::Full(_) => HiveError::TunnelFull(self.tunnel_id),
            TrySendError::Closed(_) => HiveError::TunnelClosed(self.tunnel_id),
        })
    }

    /// Receive the next chunk sent by the opposite end
    ///
    /// Returns `None` once this end is closed, or once the opposite end is
    /// closed and everything it sent has been received.
    pub async fn recv(&self) -> Option<Bytes> {
        let mut rx = self.rx.lock().await;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            chunk = rx.recv() => chunk,
            _ = self.peer_closed.cancelled() => None,
        }
    }

    /// Close this end
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Check whether this end was closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Check whether the opposite end was closed
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed.is_cancelled()
    }
}

/// Virtual circuit between one console client and one session
pub struct Tunnel {
    id: TunnelId,
    session: Arc<Session>,
    client: TunnelEnd,
    session_end: TunnelEnd,
    /// Held while a server-side close is in flight
    closing: Mutex<()>,
}

impl Tunnel {
    fn new(id: TunnelId, session: Arc<Session>, buffer: usize) -> Self {
        let (client_tx, session_rx) = mpsc::channel(buffer.max(1));
        let (session_tx, client_rx) = mpsc::channel(buffer.max(1));
        let client_closed = CancellationToken::new();
        let session_closed = CancellationToken::new();

        Self {
            id,
            session,
            client: TunnelEnd {
                tunnel_id: id,
                tx: client_tx,
                rx: Mutex::new(client_rx),
                closed: client_closed.clone(),
                peer_closed: session_closed.clone(),
            },
            session_end: TunnelEnd {
                tunnel_id: id,
                tx: session_tx,
                rx: Mutex::new(session_rx),
                closed: session_closed,
                peer_closed: client_closed,
            },
            closing: Mutex::new(()),
        }
    }

    /// Get the tunnel id
    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// Id of the session this tunnel rides on
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Session this tunnel rides on
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// End used by the console client
    pub fn client_end(&self) -> &TunnelEnd {
        &self.client
    }

    /// End used by the agent-facing relay
    pub fn session_end(&self) -> &TunnelEnd {
        &self.session_end
    }

    /// Current lifecycle state
    pub fn state(&self) -> TunnelState {
        if self.client.is_closed() {
            TunnelState::Closed
        } else {
            TunnelState::Active
        }
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .finish()
    }
}

type IdSource = Arc<dyn Fn() -> TunnelId + Send + Sync>;

/// Concurrency-safe map of tunnel id to [`Tunnel`]
///
/// Cloning yields another handle to the same directory.
#[derive(Clone)]
pub struct TunnelRegistry {
    tunnels: Arc<Mutex<HashMap<TunnelId, Arc<Tunnel>>>>,
    sessions: SessionRegistry,
    buffer: usize,
    id_source: IdSource,
}

impl TunnelRegistry {
    /// Create an empty registry resolving sessions through `sessions`
    pub fn new(sessions: SessionRegistry, config: &HiveConfig) -> Self {
        Self {
            tunnels: Arc::new(Mutex::new(HashMap::new())),
            sessions,
            buffer: config.tunnel_buffer,
            id_source: Arc::new(new_tunnel_id),
        }
    }

    /// Replace the tunnel id source
    pub fn with_id_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> TunnelId + Send + Sync + 'static,
    {
        self.id_source = Arc::new(source);
        self
    }

    /// Open a tunnel on an existing session
    ///
    /// Random ids that collide with a registered tunnel are redrawn, so an
    /// existing tunnel is never overwritten.
    pub async fn create(&self, session_id: SessionId) -> Result<Arc<Tunnel>> {
        let mut tunnels = self.tunnels.lock().await;

        // Resolved under the directory lock: a session removed before this
        // point is rejected, one removed after finds the tunnel on release
        let session = self.sessions.get(session_id).await
            .ok_or(HiveError::SessionNotFound(session_id))?;

        let id = loop {
            let candidate = (self.id_source)();
            if !tunnels.contains_key(&candidate) {
                break candidate;
            }
            warn!(tunnel_id = candidate, "Tunnel id collision, drawing a new id");
        };

        let tunnel = Arc::new(Tunnel::new(id, session, self.buffer));
        tunnels.insert(id, Arc::clone(&tunnel));

        info!(tunnel_id = id, session_id, "Tunnel created");
        Ok(tunnel)
    }

    /// Look up a tunnel by id
    pub async fn get(&self, id: TunnelId) -> Option<Arc<Tunnel>> {
        self.tunnels.lock().await.get(&id).cloned()
    }

    /// Tear a tunnel down from the server side
    ///
    /// Teardown happens in two phases. First a `TunnelClose` control
    /// envelope is pushed onto the owning session's outbound channel so the
    /// agent releases its side. Then the client end is closed and the id is
    /// removed. The session end is left to the agent-facing relay, which
    /// observes the client hang-up on its next `recv` or `send`.
    ///
    /// If the notice cannot be encoded or the push times out, the tunnel
    /// stays registered and the call can be retried. A session whose
    /// transport is already gone has no agent left to notify, so teardown
    /// proceeds.
    pub async fn close(&self, id: TunnelId) -> Result<()> {
        let tunnel = self.get(id).await.ok_or(HiveError::InvalidTunnelId(id))?;

        // Only this tunnel is locked while the notice waits for the
        // transport; the directory stays available to every other session
        let _closing = tunnel.closing.lock().await;
        if !self.is_registered(&tunnel).await {
            return Err(HiveError::InvalidTunnelId(id));
        }

        let notice = TunnelClose::new(id, tunnel.session_id()).to_envelope()?;
        match tunnel.session().push(notice).await {
            Ok(()) => {}
            Err(HiveError::TransportClosed(session_id)) => {
                debug!(tunnel_id = id, session_id, "Transport gone, skipping close notice");
            }
            Err(e) => return Err(e),
        }

        tunnel.client_end().close();
        self.remove_registered(&tunnel).await;

        info!(tunnel_id = id, session_id = tunnel.session_id(), "Tunnel closed");
        Ok(())
    }

    /// Tear a tunnel down because the agent released it
    ///
    /// Closes both ends and removes the id without notifying the agent.
    /// Returns `None` for unknown ids.
    pub async fn release(&self, id: TunnelId) -> Option<Arc<Tunnel>> {
        let tunnel = self.tunnels.lock().await.remove(&id)?;

        tunnel.client_end().close();
        tunnel.session_end().close();

        info!(tunnel_id = id, session_id = tunnel.session_id(), "Tunnel released by agent");
        Some(tunnel)
    }

    /// Every tunnel riding on `session_id`
    pub async fn for_session(&self, session_id: SessionId) -> Vec<Arc<Tunnel>> {
        let tunnels = self.tunnels.lock().await;
        tunnels
            .values()
            .filter(|tunnel| tunnel.session_id() == session_id)
            .cloned()
            .collect()
    }

    async fn is_registered(&self, tunnel: &Arc<Tunnel>) -> bool {
        self.tunnels.lock().await
            .get(&tunnel.id())
            .is_some_and(|registered| Arc::ptr_eq(registered, tunnel))
    }

    async fn remove_registered(&self, tunnel: &Arc<Tunnel>) {
        let mut tunnels = self.tunnels.lock().await;
        if tunnels.get(&tunnel.id()).is_some_and(|registered| Arc::ptr_eq(registered, tunnel)) {
            tunnels.remove(&tunnel.id());
        }
    }

    /// Number of registered tunnels
    pub async fn len(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    /// Check whether no tunnel is registered
    pub async fn is_empty(&self) -> bool {
        self.tunnels.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests;

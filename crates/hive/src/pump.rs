//! Transport pump driving a session over a byte stream

use crate::session::Delivery;
use crate::{HiveError, Result, Session, Tunnel, TunnelRegistry};
use hive_proto::{Envelope, EnvelopeCodec, MsgType, TunnelClose, TunnelData};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Moves envelopes between a session and its transport
///
/// Outbound envelopes queued on the session are framed and written to
/// `writer`. Inbound envelopes read from `reader` are delivered to waiting
/// requests, routed to tunnels, or forwarded to the unsolicited sink.
///
/// Routing never waits on a consumer. A tunnel whose console stops draining
/// its buffer is released and the agent told to drop it; unsolicited
/// envelopes that find the sink full are discarded.
pub struct ConnectionHandler<R, W> {
    /// Session being served
    session: Arc<Session>,
    /// Receiving half of the session's outbound channel
    outbound: mpsc::Receiver<Envelope>,
    /// Transport read half
    reader: R,
    /// Transport write half
    writer: W,
    /// Envelope codec for the connection
    codec: EnvelopeCodec,
    /// Tunnels fed by inbound tunnel traffic
    tunnels: TunnelRegistry,
    /// Destination for uncorrelated, non-tunnel envelopes
    unsolicited: Option<mpsc::Sender<Envelope>>,
    /// Stops the loop when cancelled
    shutdown: CancellationToken,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a new connection handler
    pub fn new(
        session: Arc<Session>,
        outbound: mpsc::Receiver<Envelope>,
        reader: R,
        writer: W,
        tunnels: TunnelRegistry,
    ) -> Self {
        Self {
            session,
            outbound,
            reader,
            writer,
            codec: EnvelopeCodec::new(),
            tunnels,
            unsolicited: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Forward uncorrelated envelopes (registration, check-ins, ...) to `sink`
    pub fn with_unsolicited(mut self, sink: mpsc::Sender<Envelope>) -> Self {
        self.unsolicited = Some(sink);
        self
    }

    /// Token that stops the loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the transport closes, a codec error occurs, or shutdown
    ///
    /// Outstanding requests on the session fail with
    /// [`HiveError::SessionClosed`](crate::HiveError::SessionClosed) once
    /// the loop stops.
    pub async fn run(mut self) -> Result<()> {
        let session_id = self.session.id();
        info!(session_id, "Starting connection handler");

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(session_id, "Received shutdown signal");
                    break Ok(());
                }

                // Handle outgoing envelopes
                envelope = self.outbound.recv() => {
                    match envelope {
                        Some(envelope) => {
                            let written = self.codec
                                .write_envelope(&mut self.writer, &envelope)
                                .await;
                            if let Err(e) = written {
                                error!(session_id, "Failed to write envelope: {}", e);
                                break Err(e.into());
                            }
                        }
                        None => {
                            debug!(session_id, "Outbound channel closed");
                            break Ok(());
                        }
                    }
                }

                // Handle incoming envelopes
                inbound = self.codec.read_envelope(&mut self.reader) => {
                    match inbound {
                        Ok(Some(envelope)) => self.handle_inbound(envelope).await,
                        Ok(None) => {
                            debug!(session_id, "Connection closed by agent");
                            break Ok(());
                        }
                        Err(e) => {
                            error!(session_id, "Failed to read envelope: {}", e);
                            break Err(e.into());
                        }
                    }
                }
            }
        };

        self.session.cancel_pending();
        info!(session_id, "Connection handler stopped");
        result
    }

    async fn handle_inbound(&mut self, envelope: Envelope) {
        let envelope = match self.session.deliver(envelope) {
            Delivery::Delivered | Delivery::Dropped(_) => return,
            Delivery::Unsolicited(envelope) => envelope,
        };

        match envelope.msg_type {
            MsgType::TunnelData => self.route_tunnel_data(&envelope).await,
            MsgType::TunnelClose => self.route_tunnel_close(&envelope).await,
            MsgType::Register | MsgType::Ping | MsgType::Kill | MsgType::Task => {
                self.forward_unsolicited(envelope)
            }
        }
    }

    async fn route_tunnel_data(&self, envelope: &Envelope) {
        let chunk = match TunnelData::from_payload(&envelope.data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(session_id = self.session.id(), "Malformed tunnel data: {}", e);
                return;
            }
        };

        let Some(tunnel) = self.owned_tunnel(chunk.tunnel_id).await else {
            return;
        };

        if !chunk.closed || !chunk.data.is_empty() {
            match tunnel.session_end().try_send(chunk.data) {
                Ok(()) => {}
                Err(HiveError::TunnelFull(tunnel_id)) => {
                    let session_id = self.session.id();
                    warn!(tunnel_id, session_id, "Tunnel buffer full, releasing");
                    self.abandon_tunnel(&tunnel).await;
                    return;
                }
                Err(e) => debug!(tunnel_id = chunk.tunnel_id, "Dropping tunnel data: {}", e),
            }
        }

        if chunk.closed {
            self.tunnels.release(chunk.tunnel_id).await;
        }
    }

    /// Release a tunnel and ask the agent to drop its side
    async fn abandon_tunnel(&self, tunnel: &Tunnel) {
        self.tunnels.release(tunnel.id()).await;

        let notice = match TunnelClose::new(tunnel.id(), tunnel.session_id()).to_envelope() {
            Ok(notice) => notice,
            Err(e) => {
                warn!(tunnel_id = tunnel.id(), "Failed to encode tunnel close: {}", e);
                return;
            }
        };
        if let Err(e) = self.session.try_push(notice) {
            debug!(tunnel_id = tunnel.id(), "Tunnel close notice not queued: {}", e);
        }
    }

    async fn route_tunnel_close(&self, envelope: &Envelope) {
        match TunnelClose::from_payload(&envelope.data) {
            Ok(notice) => {
                if self.owned_tunnel(notice.tunnel_id).await.is_some() {
                    self.tunnels.release(notice.tunnel_id).await;
                }
            }
            Err(e) => warn!(session_id = self.session.id(), "Malformed tunnel close: {}", e),
        }
    }

    /// Look up a tunnel, ignoring tunnels that ride on another session
    async fn owned_tunnel(&self, tunnel_id: u64) -> Option<Arc<Tunnel>> {
        let session_id = self.session.id();
        match self.tunnels.get(tunnel_id).await {
            Some(tunnel) if tunnel.session_id() == session_id => Some(tunnel),
            Some(tunnel) => {
                warn!(
                    tunnel_id,
                    session_id,
                    owner = tunnel.session_id(),
                    "Agent referenced a tunnel of another session"
                );
                None
            }
            None => {
                debug!(tunnel_id, session_id, "Traffic for unknown tunnel");
                None
            }
        }
    }

    fn forward_unsolicited(&mut self, envelope: Envelope) {
        let session_id = self.session.id();
        let msg_type = envelope.msg_type;

        let Some(sink) = &self.unsolicited else {
            debug!(session_id, ?msg_type, "Dropping unsolicited envelope");
            return;
        };

        match sink.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session_id, ?msg_type, "Unsolicited sink full, dropping envelope");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(session_id, "Unsolicited sink closed, dropping further envelopes");
                self.unsolicited = None;
            }
        }
    }
}

/// Copy bytes written on a tunnel's session end to the agent
///
/// Each chunk becomes a [`MsgType::TunnelData`] envelope on the owning
/// session's outbound channel. The task ends once the session end reports
/// end-of-stream.
pub fn spawn_tunnel_relay(tunnel: Arc<Tunnel>) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let session = Arc::clone(tunnel.session());

        while let Some(data) = tunnel.session_end().recv().await {
            let chunk = TunnelData::new(tunnel.id(), tunnel.session_id(), data);
            session.push(chunk.to_envelope()?).await?;
        }

        debug!(tunnel_id = tunnel.id(), "Tunnel relay finished");
        Ok(())
    })
}

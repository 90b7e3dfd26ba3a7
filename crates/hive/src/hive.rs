//! Process-wide control plane handle

use crate::event::{EventBroker, EventPublisher};
use crate::pump::ConnectionHandler;
use crate::{
    EnvelopeIdGenerator, HiveConfig, HiveError, Result, Session, SessionIdGenerator, SessionInfo,
    SessionRegistry, TunnelRegistry,
};
use hive_proto::Envelope;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Owns the identifier generators and both registries
///
/// Construct one at server start and hand clones to every component that
/// needs the hive; all clones share the same state.
#[derive(Clone)]
pub struct Hive {
    config: HiveConfig,
    session_ids: Arc<SessionIdGenerator>,
    envelope_ids: Arc<EnvelopeIdGenerator>,
    sessions: SessionRegistry,
    tunnels: TunnelRegistry,
}

impl Hive {
    /// Create a hive publishing lifecycle events to `events`
    pub fn new(config: HiveConfig, events: Arc<dyn EventPublisher>) -> Self {
        let sessions = SessionRegistry::new(events);
        let tunnels = TunnelRegistry::new(sessions.clone(), &config);

        info!(
            outbound_capacity = config.outbound_capacity,
            send_timeout = ?config.send_timeout,
            "Hive initialized"
        );

        Self {
            session_ids: Arc::new(SessionIdGenerator::new(config.session_id_start)),
            envelope_ids: Arc::new(EnvelopeIdGenerator::new()),
            config,
            sessions,
            tunnels,
        }
    }

    /// Create a hive with its own [`EventBroker`], returned for subscribing
    pub fn with_broker(config: HiveConfig) -> (Self, EventBroker) {
        let broker = EventBroker::new(config.event_capacity);
        let hive = Self::new(config, Arc::new(broker.clone()));
        (hive, broker)
    }

    /// Active configuration
    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    /// Session directory
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Tunnel directory
    pub fn tunnels(&self) -> &TunnelRegistry {
        &self.tunnels
    }

    /// Allocate an id, build a session and add it to the registry
    ///
    /// Returns the session and the outbound receiver its transport write
    /// loop must drain, or [`HiveError::SessionIdsExhausted`] once every
    /// session id has been used.
    pub async fn register(
        &self,
        info: SessionInfo,
    ) -> Result<(Arc<Session>, mpsc::Receiver<Envelope>)> {
        let id = self.session_ids.next_id().ok_or(HiveError::SessionIdsExhausted)?;
        let envelope_ids = Arc::clone(&self.envelope_ids);
        let (session, outbound) = Session::new(id, info, envelope_ids, &self.config);
        let session = self.sessions.add(Arc::new(session)).await;
        Ok((session, outbound))
    }

    /// Remove a session and release every tunnel riding on it
    ///
    /// The session leaves the registry first, so no tunnel can be created
    /// on it once its tunnels are being released. Pending requests on the
    /// session fail with [`HiveError::SessionClosed`].
    pub async fn unregister(&self, session: &Session) {
        let id = session.id();
        self.sessions.remove(id).await;
        for tunnel in self.tunnels.for_session(id).await {
            self.tunnels.release(tunnel.id()).await;
        }
        session.cancel_pending();
    }

    /// Register a session for a connected transport and build its pump
    pub async fn connect<R, W>(
        &self,
        info: SessionInfo,
        reader: R,
        writer: W,
    ) -> Result<(Arc<Session>, ConnectionHandler<R, W>)>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (session, outbound) = self.register(info).await?;
        let handler = ConnectionHandler::new(
            Arc::clone(&session),
            outbound,
            reader,
            writer,
            self.tunnels.clone(),
        );
        Ok((session, handler))
    }

    /// Serve a connected transport until it closes, then unregister it
    pub async fn serve<R, W>(
        &self,
        info: SessionInfo,
        reader: R,
        writer: W,
        unsolicited: Option<mpsc::Sender<Envelope>>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (session, mut handler) = self.connect(info, reader, writer).await?;
        if let Some(sink) = unsolicited {
            handler = handler.with_unsolicited(sink);
        }

        let result = handler.run().await;
        debug!(session_id = session.id(), "Transport finished, unregistering session");
        self.unregister(&session).await;
        result
    }
}

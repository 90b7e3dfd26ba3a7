//! Session lifecycle events

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::{Session, SessionId};

/// Lifecycle notification emitted by the session registry
#[derive(Debug, Clone)]
pub enum Event {
    /// A session was added to the hive
    SessionOpened(Arc<Session>),
    /// A session id was removed from the hive
    SessionClosed {
        /// Id passed to the removal
        id: SessionId,
        /// Session that was stored under `id`, `None` if the id was unknown
        session: Option<Arc<Session>>,
    },
}

impl Event {
    /// Id of the session this event is about
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::SessionOpened(session) => session.id(),
            Self::SessionClosed { id, .. } => *id,
        }
    }

    /// Short name of the event kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionOpened(_) => "session-opened",
            Self::SessionClosed { .. } => "session-closed",
        }
    }
}

/// Sink for lifecycle events
///
/// Called while the registry holds its write lock, so implementations must
/// return promptly and never wait on subscribers.
pub trait EventPublisher: Send + Sync {
    /// Publish an event
    fn publish(&self, event: Event);
}

/// Broadcast-backed event publisher
///
/// Every subscriber sees every event published after it subscribed. A
/// subscriber that falls more than the channel capacity behind observes a
/// lag error instead of slowing the registry down.
#[derive(Debug, Clone)]
pub struct EventBroker {
    tx: broadcast::Sender<Event>,
}

impl EventBroker {
    /// Create a broker buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventPublisher for EventBroker {
    fn publish(&self, event: Event) {
        let kind = event.kind();
        let session_id = event.session_id();
        if self.tx.send(event).is_err() {
            trace!(session_id, kind, "No subscribers for event");
        }
    }
}

//! Directory of live sessions

use crate::event::{Event, EventPublisher};
use crate::{Session, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Concurrency-safe map of session id to [`Session`]
///
/// Cloning yields another handle to the same directory. Every `add` and
/// `remove` publishes exactly one lifecycle event while the write lock is
/// held, so subscribers observe events in the same order as the mutations.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Session>>>>,
    events: Arc<dyn EventPublisher>,
}

impl SessionRegistry {
    /// Create an empty registry publishing to `events`
    pub fn new(events: Arc<dyn EventPublisher>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Snapshot of every registered session
    pub async fn all(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.values().cloned().collect()
    }

    /// Look up a session by id
    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(&id).cloned()
    }

    /// Insert a session, replacing any entry with the same id
    ///
    /// Id uniqueness is the caller's responsibility; ids from
    /// [`SessionIdGenerator`](crate::SessionIdGenerator) never collide.
    pub async fn add(&self, session: Arc<Session>) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        let id = session.id();

        if sessions.insert(id, Arc::clone(&session)).is_some() {
            warn!(session_id = id, "Replaced session with the same id");
        }

        let descriptor = session.descriptor();
        info!(
            session_id = id,
            name = %descriptor.name,
            hostname = %descriptor.hostname,
            transport = %descriptor.transport,
            "Session opened"
        );

        self.events.publish(Event::SessionOpened(Arc::clone(&session)));
        session
    }

    /// Remove a session by id
    ///
    /// Publishes a close event even for unknown ids (with no session
    /// attached) and returns whatever was stored.
    pub async fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.remove(&id);

        if session.is_some() {
            info!(session_id = id, "Session closed");
        } else {
            warn!(session_id = id, "Removing unknown session");
        }

        self.events.publish(Event::SessionClosed {
            id,
            session: session.clone(),
        });
        session
    }

    /// Number of registered sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Check whether no session is registered
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

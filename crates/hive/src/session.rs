//! Live agent connections and request/response correlation

use crate::{EnvelopeIdGenerator, HiveConfig, HiveError, Result, SessionId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hive_proto::{Envelope, MsgType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Format used for check-in timestamps shown to operators (RFC 1123)
const CHECKIN_FORMAT: &str = "%a, %d %b %Y %H:%M:%S UTC";

type PendingTable = HashMap<u64, oneshot::Sender<Envelope>>;

/// Descriptive attributes reported by an agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Implant name
    pub name: String,
    /// Host name of the remote machine
    pub hostname: String,
    /// User the agent runs as
    pub username: String,
    /// User id
    pub uid: String,
    /// Group id
    pub gid: String,
    /// Operating system
    pub os: String,
    /// Agent version
    pub version: String,
    /// CPU architecture
    pub arch: String,
    /// Transport kind (mtls, http, dns, ...)
    pub transport: String,
    /// Remote socket address
    pub remote_address: String,
    /// Process id of the agent
    pub pid: i32,
    /// Executable the agent was started from
    pub filename: String,
    /// Last time the agent checked in; `None` for stateful connections
    pub last_checkin: Option<DateTime<Utc>>,
    /// Label of the C2 endpoint currently in use
    pub active_c2: String,
}

/// Operator-facing view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Session id
    pub id: SessionId,
    /// Implant name
    pub name: String,
    /// Host name of the remote machine
    pub hostname: String,
    /// User the agent runs as
    pub username: String,
    /// User id
    pub uid: String,
    /// Group id
    pub gid: String,
    /// Operating system
    pub os: String,
    /// Agent version
    pub version: String,
    /// CPU architecture
    pub arch: String,
    /// Transport kind
    pub transport: String,
    /// Remote socket address
    pub remote_address: String,
    /// Process id of the agent
    pub pid: i32,
    /// Executable the agent was started from
    pub filename: String,
    /// RFC 1123 timestamp of the last check-in
    pub last_checkin: String,
    /// Label of the C2 endpoint currently in use
    pub active_c2: String,
}

/// Outcome of handing an inbound envelope to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The envelope reached the caller waiting on its correlation id
    Delivered,
    /// The envelope carries no correlation id; it is handed back for routing
    Unsolicited(Envelope),
    /// Nobody waits for this correlation id any more
    Dropped(u64),
}

/// One live agent connection
///
/// Owns the sending half of the outbound envelope channel; the transport
/// write loop owns the receiving half returned by [`Session::new`].
pub struct Session {
    /// Session id, fixed for the connection's lifetime
    id: SessionId,
    /// Descriptive attributes
    info: RwLock<SessionInfo>,
    /// Outbound envelopes, drained by the transport write loop
    send: mpsc::Sender<Envelope>,
    /// Reply channels of outstanding requests, keyed by correlation id
    pending: Mutex<PendingTable>,
    /// Process-wide correlation id source
    envelope_ids: Arc<EnvelopeIdGenerator>,
    /// Bound on a single outbound push
    send_timeout: Option<Duration>,
    /// Timeout used by `call`
    request_timeout: Duration,
}

impl Session {
    /// Create a session and the outbound receiver for its transport write loop
    pub fn new(
        id: SessionId,
        info: SessionInfo,
        envelope_ids: Arc<EnvelopeIdGenerator>,
        config: &HiveConfig,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let (send, outbound) = mpsc::channel(config.outbound_capacity.max(1));

        let session = Self {
            id,
            info: RwLock::new(info),
            send,
            pending: Mutex::new(HashMap::new()),
            envelope_ids,
            send_timeout: config.send_timeout,
            request_timeout: config.request_timeout,
        };

        (session, outbound)
    }

    /// Get the session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Snapshot of the descriptive attributes
    pub fn info(&self) -> SessionInfo {
        self.info.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Refresh descriptive attributes in place
    pub fn update_info<F>(&self, update: F)
    where
        F: FnOnce(&mut SessionInfo),
    {
        let mut info = self.info.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut info);
    }

    /// Record a check-in at the current time
    pub fn touch(&self) {
        self.update_info(|info| info.last_checkin = Some(Utc::now()));
    }

    /// Build the operator-facing descriptor
    ///
    /// Sessions that never checked in report the current time.
    pub fn descriptor(&self) -> SessionDescriptor {
        let info = self.info();
        let last_checkin = info.last_checkin.unwrap_or_else(Utc::now);

        SessionDescriptor {
            id: self.id,
            name: info.name,
            hostname: info.hostname,
            username: info.username,
            uid: info.uid,
            gid: info.gid,
            os: info.os,
            version: info.version,
            arch: info.arch,
            transport: info.transport,
            remote_address: info.remote_address,
            pid: info.pid,
            filename: info.filename,
            last_checkin: last_checkin.format(CHECKIN_FORMAT).to_string(),
            active_c2: info.active_c2,
        }
    }

    /// Send a request and wait for the matching reply
    ///
    /// The push onto the outbound channel waits while the transport is not
    /// draining it (bounded by the configured send timeout). `timeout` only
    /// covers the wait for the reply. The correlation id is deregistered on
    /// every exit path, including the returned future being dropped; a reply
    /// arriving afterwards is discarded by [`Session::deliver`].
    pub async fn request(
        &self,
        msg_type: MsgType,
        timeout_after: Duration,
        data: impl Into<Bytes>,
    ) -> Result<Bytes> {
        let request_id = self.envelope_ids.next_id();
        let (reply_tx, reply_rx) = oneshot::channel();

        let _pending = self.register_pending(request_id, reply_tx);

        self.push(Envelope::new(request_id, msg_type, data)).await?;
        trace!(session_id = self.id, request_id, ?msg_type, "Request sent");

        let reply = timeout(timeout_after, reply_rx).await
            .map_err(|_| {
                debug!(session_id = self.id, request_id, ?msg_type, "Request timed out");
                HiveError::Timeout { duration: timeout_after }
            })?
            .map_err(|_| HiveError::SessionClosed(self.id))?;

        Ok(reply.data)
    }

    /// Send a request using the configured default timeout
    pub async fn call(&self, msg_type: MsgType, data: impl Into<Bytes>) -> Result<Bytes> {
        self.request(msg_type, self.request_timeout, data).await
    }

    /// Push an envelope that expects no reply
    pub async fn send(&self, msg_type: MsgType, data: impl Into<Bytes>) -> Result<()> {
        self.push(Envelope::unsolicited(msg_type, data)).await
    }

    /// Push an envelope onto the outbound channel
    ///
    /// Fails with [`HiveError::TransportClosed`] when the write loop is gone
    /// and with [`HiveError::TransportUnavailable`] when the send timeout
    /// expires while the channel stays full.
    pub async fn push(&self, envelope: Envelope) -> Result<()> {
        let sent = match self.send_timeout {
            Some(limit) => match timeout(limit, self.send.send(envelope)).await {
                Ok(sent) => sent,
                Err(_) => {
                    warn!(session_id = self.id, waited = ?limit, "Outbound channel stalled");
                    return Err(HiveError::TransportUnavailable {
                        session_id: self.id,
                        waited: limit,
                    });
                }
            },
            None => self.send.send(envelope).await,
        };

        sent.map_err(|_| HiveError::TransportClosed(self.id))
    }

    /// Queue an envelope only if the outbound channel has room
    ///
    /// Used where waiting on the transport is not an option; a full channel
    /// fails immediately with [`HiveError::TransportUnavailable`].
    pub fn try_push(&self, envelope: Envelope) -> Result<()> {
        self.send.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => HiveError::TransportUnavailable {
                session_id: self.id,
                waited: Duration::ZERO,
            },
            TrySendError::Closed(_) => HiveError::TransportClosed(self.id),
        })
    }

    /// Hand an inbound envelope to the caller waiting on its correlation id
    ///
    /// Never blocks: the waiter is removed from the pending table and handed
    /// the envelope through its one-shot channel.
    pub fn deliver(&self, envelope: Envelope) -> Delivery {
        if !envelope.is_correlated() {
            return Delivery::Unsolicited(envelope);
        }

        let request_id = envelope.id;
        let waiter = self.pending_table().remove(&request_id);

        match waiter {
            Some(reply_tx) => {
                if reply_tx.send(envelope).is_err() {
                    debug!(session_id = self.id, request_id, "Reply arrived after caller gave up");
                    return Delivery::Dropped(request_id);
                }
                Delivery::Delivered
            }
            None => {
                debug!(session_id = self.id, request_id, "Dropping reply for unknown request");
                Delivery::Dropped(request_id)
            }
        }
    }

    /// Fail every outstanding request with [`HiveError::SessionClosed`]
    ///
    /// Returns the number of requests that were waiting.
    pub fn cancel_pending(&self) -> usize {
        let cancelled: Vec<_> = self.pending_table().drain().collect();
        if !cancelled.is_empty() {
            debug!(session_id = self.id, count = cancelled.len(), "Cancelled pending requests");
        }
        cancelled.len()
    }

    /// Number of requests waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.pending_table().len()
    }

    /// Check whether the transport write loop dropped the outbound channel
    pub fn is_transport_closed(&self) -> bool {
        self.send.is_closed()
    }

    fn pending_table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_pending(
        &self,
        request_id: u64,
        reply_tx: oneshot::Sender<Envelope>,
    ) -> PendingGuard<'_> {
        if self.pending_table().insert(request_id, reply_tx).is_some() {
            warn!(session_id = self.id, request_id, "Correlation id reused while pending");
        }
        PendingGuard { session: self, request_id }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.info().name)
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Removes a correlation id from the pending table when dropped
struct PendingGuard<'a> {
    session: &'a Session,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.pending_table().remove(&self.request_id);
    }
}

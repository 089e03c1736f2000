//! Connection registry for live WebSocket subscribers.
//!
//! Sessions are keyed by [`SessionId`] and hold the sending half of a bounded
//! channel drained by the socket's writer task. All operations go through a
//! single mutex so register, unregister and broadcast are atomic relative to
//! each other.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::{ACTIVE_SESSIONS, BROADCAST_DELIVERED, SESSIONS_PRUNED};

/// Per-session outbound buffer. A client this far behind is dropped.
pub const SESSION_BUFFER: usize = 256;

/// Identity plus admission time plus a random suffix, so rapid repeat
/// admissions of the same identity never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate(identity: &str) -> Self {
        let admitted = chrono::Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}:{}:{}", identity, admitted, &suffix[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("channel full")]
    Full,
}

/// Outbound half of a subscriber's duplex connection
pub trait SessionChannel: Send + Sync {
    /// Queue one payload without waiting
    fn deliver(&self, payload: &str) -> Result<(), ChannelError>;
}

impl SessionChannel for mpsc::Sender<String> {
    fn deliver(&self, payload: &str) -> Result<(), ChannelError> {
        self.try_send(payload.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
            mpsc::error::TrySendError::Full(_) => ChannelError::Full,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    NotFound,
}

type SessionMap = HashMap<SessionId, Box<dyn SessionChannel>>;

#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<SessionMap>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a session. Re-registering an id replaces its channel; the
    /// superseded channel is handed back.
    pub async fn register(
        &self,
        id: SessionId,
        channel: Box<dyn SessionChannel>,
    ) -> Option<Box<dyn SessionChannel>> {
        let mut sessions = self.sessions.lock().await;
        let previous = sessions.insert(id.clone(), channel);
        ACTIVE_SESSIONS.set(sessions.len() as i64);

        if previous.is_some() {
            warn!(session = %id, "Session re-registered, previous channel superseded");
        } else {
            info!(session = %id, active = sessions.len(), "Session registered");
        }
        previous
    }

    /// Remove a session; absent ids are ignored
    pub async fn unregister(&self, id: &SessionId) {
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(id).is_some() {
            ACTIVE_SESSIONS.set(sessions.len() as i64);
            info!(session = %id, active = sessions.len(), "Session unregistered");
        }
    }

    /// Deliver to one session. A failed write prunes the session.
    pub async fn send_to(&self, id: &SessionId, payload: &str) -> SendOutcome {
        let mut sessions = self.sessions.lock().await;
        let Some(channel) = sessions.get(id) else {
            debug!(session = %id, "Send to unknown session");
            return SendOutcome::NotFound;
        };

        match channel.deliver(payload) {
            Ok(()) => SendOutcome::Delivered,
            Err(e) => {
                sessions.remove(id);
                ACTIVE_SESSIONS.set(sessions.len() as i64);
                SESSIONS_PRUNED.inc();
                warn!(session = %id, error = %e, "Pruned session after failed send");
                SendOutcome::NotFound
            }
        }
    }

    /// Deliver to every session; returns how many writes succeeded.
    ///
    /// Sessions whose write fails are pruned without affecting the rest.
    pub async fn broadcast(&self, payload: &str) -> usize {
        let mut sessions = self.sessions.lock().await;
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, channel) in sessions.iter() {
            match channel.deliver(payload) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((id.clone(), e)),
            }
        }

        for (id, e) in &failed {
            sessions.remove(id);
            warn!(session = %id, error = %e, "Pruned session during broadcast");
        }
        if !failed.is_empty() {
            SESSIONS_PRUNED.inc_by(failed.len() as u64);
            ACTIVE_SESSIONS.set(sessions.len() as i64);
        }

        BROADCAST_DELIVERED.inc_by(delivered as u64);
        debug!(delivered, pruned = failed.len(), "Broadcast complete");
        delivered
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use courier_core::{AgentId, BrokerMessage, ConnectionId};
use serde::Serialize;
use tokio::sync::mpsc;

/// Why a push down an agent's stream failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("stream closed")]
    Closed,
    #[error("send queue full")]
    Full,
}

/// One connected agent and the sink that reaches it.
pub struct AgentSession {
    agent_id: AgentId,
    connection_id: ConnectionId,
    tx: mpsc::Sender<BrokerMessage>,
    connected_at: DateTime<Utc>,
    last_seen_ms: AtomicI64,
}

impl AgentSession {
    pub fn new(agent_id: AgentId, connection_id: ConnectionId, tx: mpsc::Sender<BrokerMessage>) -> Self {
        let now = Utc::now();
        Self {
            agent_id,
            connection_id,
            tx,
            connected_at: now,
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Enqueue a message for the stream's writer. Never waits: a full queue
    /// is reported rather than applying backpressure to the caller.
    pub fn push(&self, message: BrokerMessage) -> Result<(), PushError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.last_seen_ms.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent_id: self.agent_id.clone(),
            connection_id: self.connection_id.clone(),
            connected_at: self.connected_at.to_rfc3339(),
            last_seen: self.last_seen().to_rfc3339(),
        }
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("agent_id", &self.agent_id)
            .field("connection_id", &self.connection_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Serializable view of a session for listings.
#[derive(Clone, Debug, Serialize)]
pub struct AgentSummary {
    pub agent_id: AgentId,
    pub connection_id: ConnectionId,
    pub connected_at: String,
    pub last_seen: String,
}

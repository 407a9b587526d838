use std::sync::Arc;

use courier_core::{AgentId, ConnectionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::session::{AgentSession, AgentSummary};

/// Which agents are reachable right now, and through which session.
///
/// Holds at most one session per agent id. A session is never replaced while
/// registered; it has to be removed first.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<AgentId, Arc<AgentSession>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session` unless `agent_id` is already registered.
    /// Returns whether the session was inserted.
    pub fn register(&self, agent_id: AgentId, session: Arc<AgentSession>) -> bool {
        match self.sessions.entry(agent_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    pub fn lookup(&self, agent_id: &AgentId) -> Option<Arc<AgentSession>> {
        self.sessions.get(agent_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, agent_id: &AgentId) {
        self.sessions.remove(agent_id);
    }

    /// Remove the entry for `agent_id` only if it belongs to `connection_id`.
    pub fn remove_session(&self, agent_id: &AgentId, connection_id: &ConnectionId) -> bool {
        self.sessions
            .remove_if(agent_id, |_, session| session.connection_id() == connection_id)
            .is_some()
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.sessions.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Summaries of every registered agent, sorted by id.
    pub fn agents(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<AgentSummary> = self
            .sessions
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        agents.sort_by(|a, b| a.agent_id.as_str().cmp(b.agent_id.as_str()));
        agents
    }
}

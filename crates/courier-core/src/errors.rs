use std::time::Duration;

use crate::ids::AgentId;

/// Why a command could not be turned into a reply.
///
/// None of these are fatal to the broker; the controller decides whether to
/// retry.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("agent {0} is not connected")]
    AgentNotConnected(AgentId),

    #[error("a command is already in flight for agent {0}")]
    CommandAlreadyInFlight(AgentId),

    #[error("failed to deliver command to agent {agent_id}: {reason}")]
    DeliveryFailed { agent_id: AgentId, reason: String },

    #[error("agent {agent_id} did not respond within {timeout:?}")]
    Timeout { agent_id: AgentId, timeout: Duration },

    #[error("agent {0} disconnected before replying")]
    AgentDisconnected(AgentId),
}

impl DispatchError {
    pub fn agent_id(&self) -> &AgentId {
        match self {
            Self::AgentNotConnected(id)
            | Self::CommandAlreadyInFlight(id)
            | Self::AgentDisconnected(id) => id,
            Self::DeliveryFailed { agent_id, .. } | Self::Timeout { agent_id, .. } => agent_id,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AgentNotConnected(_) => "agent_not_connected",
            Self::CommandAlreadyInFlight(_) => "command_already_in_flight",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::Timeout { .. } => "timeout",
            Self::AgentDisconnected(_) => "agent_disconnected",
        }
    }

    /// Wire error code for controller-facing responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AgentNotConnected(_) => "AGENT_NOT_CONNECTED",
            Self::CommandAlreadyInFlight(_) => "COMMAND_ALREADY_IN_FLIGHT",
            Self::DeliveryFailed { .. } => "DELIVERY_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::AgentDisconnected(_) => "AGENT_DISCONNECTED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_agent() {
        let err = DispatchError::AgentNotConnected(AgentId::from("B"));
        assert_eq!(err.to_string(), "agent B is not connected");

        let err = DispatchError::Timeout {
            agent_id: AgentId::from("A"),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "agent A did not respond within 10s");
    }

    #[test]
    fn kinds_and_codes_line_up() {
        let id = AgentId::from("A");
        let errors = [
            DispatchError::AgentNotConnected(id.clone()),
            DispatchError::CommandAlreadyInFlight(id.clone()),
            DispatchError::DeliveryFailed {
                agent_id: id.clone(),
                reason: "stream closed".into(),
            },
            DispatchError::Timeout {
                agent_id: id.clone(),
                timeout: Duration::from_millis(5),
            },
            DispatchError::AgentDisconnected(id.clone()),
        ];
        for err in &errors {
            assert_eq!(err.code().to_lowercase(), err.error_kind());
            assert_eq!(err.agent_id(), &id);
        }
    }
}

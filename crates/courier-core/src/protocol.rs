use serde::{Deserialize, Serialize};

use crate::ids::AgentId;

/// Messages an agent sends up its stream.
///
/// Every variant carries the sender's id, so any message doubles as an
/// identity announcement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Hello {
        agent_id: AgentId,
    },

    Heartbeat {
        agent_id: AgentId,
    },

    Reply {
        agent_id: AgentId,
        #[serde(default = "default_success")]
        success: bool,
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
}

impl AgentMessage {
    pub fn agent_id(&self) -> &AgentId {
        match self {
            Self::Hello { agent_id } | Self::Heartbeat { agent_id } | Self::Reply { agent_id, .. } => {
                agent_id
            }
        }
    }

    pub fn reply(agent_id: AgentId, reply: CommandReply) -> Self {
        Self::Reply {
            agent_id,
            success: reply.success,
            message: reply.message,
            payload: reply.payload,
        }
    }

    /// Reply body, if this is a reply.
    pub fn into_reply(self) -> Option<(AgentId, CommandReply)> {
        match self {
            Self::Reply {
                agent_id,
                success,
                message,
                payload,
            } => Some((
                agent_id,
                CommandReply {
                    success,
                    message,
                    payload,
                },
            )),
            _ => None,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Reply { .. } => "reply",
        }
    }
}

/// An agent's answer to a command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

fn default_success() -> bool {
    true
}

impl CommandReply {
    pub fn ok(payload: serde_json::Value) -> Self {
        Self {
            success: true,
            message: String::new(),
            payload: Some(payload),
        }
    }
}

/// Messages the broker pushes down an agent's stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    Command { payload: serde_json::Value },
}

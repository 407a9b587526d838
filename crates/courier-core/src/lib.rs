//! Shared types for the courier broker: identifiers, wire messages and the
//! dispatch error taxonomy.

pub mod errors;
pub mod ids;
pub mod protocol;

pub use errors::DispatchError;
pub use ids::{AgentId, ConnectionId};
pub use protocol::{AgentMessage, BrokerMessage, CommandReply};

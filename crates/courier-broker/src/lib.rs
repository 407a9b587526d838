pub mod broker;
pub mod correlator;
pub mod dispatcher;
pub mod registry;
pub mod session;
pub mod stream;

pub use broker::{Broker, BrokerConfig, ForwardResponse};
pub use correlator::{CorrelatorError, ReplyCorrelator, ResponseCorrelator, WaitOutcome, WaiterHandle};
pub use dispatcher::{CommandDispatcher, DEFAULT_COMMAND_TIMEOUT};
pub use registry::ConnectionRegistry;
pub use session::{AgentSession, AgentSummary, PushError};
pub use stream::InboundStreamHandler;

use std::sync::Arc;
use std::time::Duration;

use courier_core::{AgentId, BrokerMessage, CommandReply, DispatchError};
use courier_telemetry::MetricsRecorder;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::correlator::ReplyCorrelator;
use crate::dispatcher::{CommandDispatcher, DEFAULT_COMMAND_TIMEOUT};
use crate::registry::ConnectionRegistry;
use crate::session::AgentSummary;
use crate::stream::InboundStreamHandler;

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Used when a caller does not specify a timeout.
    pub command_timeout: Duration,
    /// Capacity of each agent's outbound queue.
    pub send_queue: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            send_queue: 256,
        }
    }
}

/// Controller-facing result of forwarding one command.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForwardResponse {
    pub agent_id: AgentId,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Machine-readable failure kind, set only when the broker itself failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ForwardResponse {
    pub fn from_result(agent_id: AgentId, result: Result<CommandReply, DispatchError>) -> Self {
        match result {
            Ok(reply) => Self {
                agent_id,
                success: reply.success,
                message: reply.message,
                payload: reply.payload,
                error: None,
            },
            Err(e) => Self {
                agent_id,
                success: false,
                message: e.to_string(),
                payload: None,
                error: Some(e.code().to_string()),
            },
        }
    }
}

/// One self-contained broker: its own registry, correlator and dispatcher.
/// Cloning shares the same state.
#[derive(Clone)]
pub struct Broker {
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<ReplyCorrelator>,
    dispatcher: Arc<CommandDispatcher>,
    metrics: Arc<MetricsRecorder>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_metrics(config, Arc::new(MetricsRecorder::new()))
    }

    pub fn with_metrics(config: BrokerConfig, metrics: Arc<MetricsRecorder>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let correlator = Arc::new(ReplyCorrelator::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&correlator),
            Arc::clone(&metrics),
            config.command_timeout,
        ));
        Self {
            registry,
            correlator,
            dispatcher,
            metrics,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// A handler for a freshly accepted stream, plus the receiving end of its
    /// outbound queue for the transport's writer.
    pub fn open_stream(&self) -> (InboundStreamHandler, mpsc::Receiver<BrokerMessage>) {
        let (tx, rx) = mpsc::channel(self.config.send_queue.max(1));
        let handler = InboundStreamHandler::new(
            tx,
            Arc::clone(&self.registry),
            Arc::clone(&self.correlator),
            Arc::clone(&self.metrics),
        );
        (handler, rx)
    }

    pub async fn dispatch(
        &self,
        agent_id: &AgentId,
        command: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<CommandReply, DispatchError> {
        self.dispatcher.dispatch(agent_id, command, timeout).await
    }

    pub async fn forward_to_client(
        &self,
        agent_id: AgentId,
        command: serde_json::Value,
        timeout: Option<Duration>,
    ) -> ForwardResponse {
        let result = self.dispatch(&agent_id, command, timeout).await;
        ForwardResponse::from_result(agent_id, result)
    }

    pub fn agents(&self) -> Vec<AgentSummary> {
        self.registry.agents()
    }

    pub fn pending(&self) -> usize {
        self.correlator.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::AgentMessage;
    use serde_json::json;
    use tokio_stream::wrappers::ReceiverStream;

    /// Spawn a fake agent on `broker` that answers every command with
    /// `{"echo": <command>}`.
    fn spawn_echo_agent(broker: &Broker, id: &'static str) -> mpsc::Sender<AgentMessage> {
        let (mut handler, mut outbound) = broker.open_stream();
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        tokio::spawn(async move {
            handler.run(ReceiverStream::new(inbound_rx)).await;
        });

        let replies = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(BrokerMessage::Command { payload }) = outbound.recv().await {
                let reply = CommandReply::ok(json!({ "echo": payload }));
                if replies
                    .send(AgentMessage::reply(AgentId::from(id), reply))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        inbound_tx
    }

    async fn wait_registered(broker: &Broker, id: &str) {
        while !broker.registry().contains(&AgentId::from(id)) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn forward_round_trip() {
        let broker = Broker::new(BrokerConfig::default());
        let agent = spawn_echo_agent(&broker, "A");
        agent
            .send(AgentMessage::Hello { agent_id: AgentId::from("A") })
            .await
            .unwrap();
        wait_registered(&broker, "A").await;

        let response = broker
            .forward_to_client(AgentId::from("A"), json!("ping"), None)
            .await;
        assert!(response.success);
        assert_eq!(response.payload, Some(json!({"echo": "ping"})));
        assert!(response.error.is_none());
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test]
    async fn forward_to_unknown_agent() {
        let broker = Broker::new(BrokerConfig::default());
        let response = broker
            .forward_to_client(AgentId::from("B"), json!("ping"), None)
            .await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("AGENT_NOT_CONNECTED"));
        assert_eq!(response.message, "agent B is not connected");
    }

    #[tokio::test]
    async fn disconnect_during_wait_is_prompt() {
        let broker = Broker::new(BrokerConfig::default());
        let (mut handler, mut outbound) = broker.open_stream();
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        inbound_tx
            .send(AgentMessage::Hello { agent_id: AgentId::from("A") })
            .await
            .unwrap();
        tokio::spawn(async move {
            handler.run(ReceiverStream::new(inbound_rx)).await;
        });
        wait_registered(&broker, "A").await;

        // The agent receives the command, then its transport ends.
        tokio::spawn(async move {
            outbound.recv().await;
            drop(inbound_tx);
        });

        let started = std::time::Instant::now();
        let response = broker
            .forward_to_client(AgentId::from("A"), json!("ping"), None)
            .await;
        assert_eq!(response.error.as_deref(), Some("AGENT_DISCONNECTED"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(broker.agents().is_empty());
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test]
    async fn brokers_are_independent() {
        let first = Broker::new(BrokerConfig::default());
        let second = Broker::new(BrokerConfig::default());

        let agent = spawn_echo_agent(&first, "A");
        agent
            .send(AgentMessage::Heartbeat { agent_id: AgentId::from("A") })
            .await
            .unwrap();
        wait_registered(&first, "A").await;

        assert!(!second.registry().contains(&AgentId::from("A")));
        let response = second
            .forward_to_client(AgentId::from("A"), json!("ping"), None)
            .await;
        assert_eq!(response.error.as_deref(), Some("AGENT_NOT_CONNECTED"));
    }

    #[test]
    fn failed_reply_maps_to_unsuccessful_response() {
        let reply = CommandReply {
            success: false,
            message: "no such file".into(),
            payload: None,
        };
        let response = ForwardResponse::from_result(AgentId::from("A"), Ok(reply));
        assert!(!response.success);
        assert_eq!(response.message, "no such file");
        assert!(response.error.is_none());

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("payload").is_none());
        assert!(json.get("error").is_none());
    }
}

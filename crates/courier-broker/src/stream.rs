use std::sync::Arc;

use courier_core::{AgentId, AgentMessage, BrokerMessage, ConnectionId};
use courier_telemetry::MetricsRecorder;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::correlator::ReplyCorrelator;
use crate::registry::ConnectionRegistry;
use crate::session::AgentSession;

/// What this stream is to the registry.
enum Binding {
    /// No message seen yet.
    Unbound,
    /// Registered session for the agent.
    Owner(Arc<AgentSession>),
    /// Another stream already owns this agent id.
    Shadow(AgentId),
}

/// Drives one agent stream from first message to termination.
///
/// Cleanup runs exactly once: at the end of [`run`](Self::run), on an explicit
/// [`close`](Self::close), or when the handler is dropped, whichever comes
/// first.
pub struct InboundStreamHandler {
    connection_id: ConnectionId,
    outbound: mpsc::Sender<BrokerMessage>,
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<ReplyCorrelator>,
    metrics: Arc<MetricsRecorder>,
    binding: Binding,
    closed: bool,
}

impl InboundStreamHandler {
    pub fn new(
        outbound: mpsc::Sender<BrokerMessage>,
        registry: Arc<ConnectionRegistry>,
        correlator: Arc<ReplyCorrelator>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            outbound,
            registry,
            correlator,
            metrics,
            binding: Binding::Unbound,
            closed: false,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// The agent this stream speaks for, once it has announced itself.
    pub fn agent_id(&self) -> Option<&AgentId> {
        match &self.binding {
            Binding::Unbound => None,
            Binding::Owner(session) => Some(session.agent_id()),
            Binding::Shadow(agent_id) => Some(agent_id),
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.binding, Binding::Owner(_))
    }

    /// Process messages until the transport ends, then clean up.
    #[tracing::instrument(skip_all, fields(connection_id = %self.connection_id))]
    pub async fn run<S>(&mut self, inbound: S)
    where
        S: Stream<Item = AgentMessage>,
    {
        futures::pin_mut!(inbound);
        while let Some(message) = inbound.next().await {
            self.handle_message(message);
        }
        self.close();
    }

    pub fn handle_message(&mut self, message: AgentMessage) {
        if self.closed {
            return;
        }
        if !self.bind(message.agent_id()) {
            tracing::warn!(
                connection_id = %self.connection_id,
                claimed = %message.agent_id(),
                kind = message.kind(),
                "Message for a different agent on bound stream, dropping"
            );
            return;
        }

        let Binding::Owner(session) = &self.binding else {
            tracing::debug!(
                connection_id = %self.connection_id,
                agent_id = %message.agent_id(),
                kind = message.kind(),
                "Ignoring message from shadow stream"
            );
            return;
        };
        session.touch();

        match message {
            AgentMessage::Hello { agent_id } => {
                tracing::debug!(agent_id = %agent_id, "Hello");
            }
            AgentMessage::Heartbeat { agent_id } => {
                tracing::trace!(agent_id = %agent_id, "Heartbeat");
            }
            reply @ AgentMessage::Reply { .. } => {
                let Some((agent_id, reply)) = reply.into_reply() else {
                    return;
                };
                tracing::debug!(
                    agent_id = %agent_id,
                    success = reply.success,
                    message = %reply.message,
                    "Reply received"
                );
                if !self.correlator.resolve(&agent_id, reply) {
                    tracing::debug!(agent_id = %agent_id, "No waiter for reply, dropping");
                    self.metrics.counter_inc("courier.replies.unmatched", &[], 1);
                }
            }
        }
    }

    /// Bind to `agent_id` on first sight, and keep trying to take ownership
    /// while shadowed. Returns false if the stream is bound to another id.
    fn bind(&mut self, agent_id: &AgentId) -> bool {
        match &self.binding {
            Binding::Owner(session) => return session.agent_id() == agent_id,
            Binding::Shadow(bound) if bound != agent_id => return false,
            Binding::Shadow(_) | Binding::Unbound => {}
        }

        let session = Arc::new(AgentSession::new(
            agent_id.clone(),
            self.connection_id.clone(),
            self.outbound.clone(),
        ));
        if self.registry.register(agent_id.clone(), Arc::clone(&session)) {
            tracing::info!(
                agent_id = %agent_id,
                connection_id = %self.connection_id,
                "Agent connected"
            );
            self.metrics.gauge_inc("courier.agents.connected", &[], 1.0);
            self.binding = Binding::Owner(session);
        } else if matches!(self.binding, Binding::Unbound) {
            tracing::warn!(
                agent_id = %agent_id,
                connection_id = %self.connection_id,
                "Agent id already held by another stream"
            );
            self.binding = Binding::Shadow(agent_id.clone());
        }
        true
    }

    /// Remove this stream's registration and fail its outstanding command.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let Binding::Owner(session) = &self.binding else {
            tracing::debug!(connection_id = %self.connection_id, "Unregistered stream closed");
            return;
        };
        let agent_id = session.agent_id();

        let removed = self.registry.remove_session(agent_id, &self.connection_id);
        if removed {
            self.metrics.gauge_inc("courier.agents.connected", &[], -1.0);
        }
        // Leave the waiter alone only if a different stream now owns the id.
        let superseded = !removed && self.registry.contains(agent_id);
        if !superseded && self.correlator.cancel(agent_id) {
            tracing::info!(agent_id = %agent_id, "Cancelled in-flight command on disconnect");
        }

        tracing::info!(
            agent_id = %agent_id,
            connection_id = %self.connection_id,
            "Agent disconnected"
        );
    }
}

impl Drop for InboundStreamHandler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::WaitOutcome;
    use courier_core::CommandReply;
    use serde_json::json;
    use std::time::Duration;
    use tokio_stream::wrappers::ReceiverStream;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        correlator: Arc<ReplyCorrelator>,
        metrics: Arc<MetricsRecorder>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(ConnectionRegistry::new()),
                correlator: Arc::new(ReplyCorrelator::new()),
                metrics: Arc::new(MetricsRecorder::new()),
            }
        }

        fn handler(&self) -> (InboundStreamHandler, mpsc::Receiver<BrokerMessage>) {
            let (tx, rx) = mpsc::channel(8);
            let handler = InboundStreamHandler::new(
                tx,
                Arc::clone(&self.registry),
                Arc::clone(&self.correlator),
                Arc::clone(&self.metrics),
            );
            (handler, rx)
        }
    }

    fn hello(id: &str) -> AgentMessage {
        AgentMessage::Hello { agent_id: AgentId::from(id) }
    }

    fn heartbeat(id: &str) -> AgentMessage {
        AgentMessage::Heartbeat { agent_id: AgentId::from(id) }
    }

    fn reply(id: &str, payload: serde_json::Value) -> AgentMessage {
        AgentMessage::reply(AgentId::from(id), CommandReply::ok(payload))
    }

    #[test]
    fn first_message_registers_agent() {
        let fx = Fixture::new();
        let (mut handler, _rx) = fx.handler();
        assert!(handler.agent_id().is_none());

        handler.handle_message(heartbeat("A"));
        assert!(handler.is_registered());
        assert_eq!(handler.agent_id().unwrap().as_str(), "A");

        let session = fx.registry.lookup(&AgentId::from("A")).unwrap();
        assert_eq!(session.connection_id(), handler.connection_id());
        assert_eq!(fx.metrics.gauge_get("courier.agents.connected", &[]), 1.0);
    }

    #[test]
    fn repeated_hello_is_noop() {
        let fx = Fixture::new();
        let (mut handler, _rx) = fx.handler();
        handler.handle_message(hello("A"));
        let first = fx.registry.lookup(&AgentId::from("A")).unwrap();
        handler.handle_message(hello("A"));
        let again = fx.registry.lookup(&AgentId::from("A")).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(fx.registry.len(), 1);
    }

    #[test]
    fn close_removes_agent_once() {
        let fx = Fixture::new();
        let (mut handler, _rx) = fx.handler();
        handler.handle_message(hello("A"));

        handler.close();
        handler.close();
        assert!(fx.registry.is_empty());
        assert_eq!(fx.metrics.gauge_get("courier.agents.connected", &[]), 0.0);
    }

    #[test]
    fn drop_cleans_up() {
        let fx = Fixture::new();
        let (mut handler, _rx) = fx.handler();
        handler.handle_message(hello("A"));
        drop(handler);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn reply_resolves_waiter() {
        let fx = Fixture::new();
        let (mut handler, _rx) = fx.handler();
        handler.handle_message(hello("A"));

        let waiter = fx.correlator.create_waiter(AgentId::from("A")).unwrap();
        handler.handle_message(reply("A", json!("pong")));

        let outcome = waiter.wait(Duration::from_secs(1)).await;
        assert_eq!(outcome, WaitOutcome::Resolved(CommandReply::ok(json!("pong"))));
        assert!(fx.correlator.is_empty());
    }

    #[test]
    fn unmatched_reply_is_counted_not_raised() {
        let fx = Fixture::new();
        let (mut handler, _rx) = fx.handler();
        handler.handle_message(reply("A", json!("stray")));
        assert!(handler.is_registered());
        assert_eq!(fx.metrics.counter_get("courier.replies.unmatched", &[]), 1);
    }

    #[tokio::test]
    async fn close_cancels_outstanding_waiter() {
        let fx = Fixture::new();
        let (mut handler, _rx) = fx.handler();
        handler.handle_message(hello("A"));
        let waiter = fx.correlator.create_waiter(AgentId::from("A")).unwrap();

        handler.close();
        assert_eq!(waiter.wait(Duration::from_secs(1)).await, WaitOutcome::Disconnected);
        assert!(fx.registry.is_empty());
    }

    #[test]
    fn messages_for_other_agents_are_dropped() {
        let fx = Fixture::new();
        let (mut handler, _rx) = fx.handler();
        handler.handle_message(hello("A"));
        handler.handle_message(hello("B"));
        assert_eq!(handler.agent_id().unwrap().as_str(), "A");
        assert!(!fx.registry.contains(&AgentId::from("B")));
    }

    #[tokio::test]
    async fn shadow_stream_cannot_touch_owner_state() {
        let fx = Fixture::new();
        let (mut owner, _rx1) = fx.handler();
        let (mut shadow, _rx2) = fx.handler();
        owner.handle_message(hello("A"));
        shadow.handle_message(hello("A"));
        assert!(!shadow.is_registered());

        let waiter = fx.correlator.create_waiter(AgentId::from("A")).unwrap();
        shadow.handle_message(reply("A", json!("spoofed")));
        assert!(fx.correlator.contains(&AgentId::from("A")));

        shadow.close();
        let session = fx.registry.lookup(&AgentId::from("A")).unwrap();
        assert_eq!(session.connection_id(), owner.connection_id());

        owner.handle_message(reply("A", json!("real")));
        let outcome = waiter.wait(Duration::from_secs(1)).await;
        assert_eq!(outcome, WaitOutcome::Resolved(CommandReply::ok(json!("real"))));
    }

    #[test]
    fn shadow_takes_over_after_owner_leaves() {
        let fx = Fixture::new();
        let (mut owner, _rx1) = fx.handler();
        let (mut shadow, _rx2) = fx.handler();
        owner.handle_message(hello("A"));
        shadow.handle_message(hello("A"));

        owner.close();
        shadow.handle_message(heartbeat("A"));
        assert!(shadow.is_registered());
        let session = fx.registry.lookup(&AgentId::from("A")).unwrap();
        assert_eq!(session.connection_id(), shadow.connection_id());
    }

    #[tokio::test]
    async fn run_cleans_up_when_stream_ends() {
        let fx = Fixture::new();
        let (mut handler, _rx) = fx.handler();
        let (tx, inbound) = mpsc::channel(8);

        tx.send(hello("A")).await.unwrap();
        tx.send(heartbeat("A")).await.unwrap();
        drop(tx);

        handler.run(ReceiverStream::new(inbound)).await;
        assert_eq!(handler.agent_id().unwrap().as_str(), "A");
        assert!(fx.registry.is_empty());
    }
}

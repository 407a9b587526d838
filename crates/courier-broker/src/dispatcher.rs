use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_core::{AgentId, BrokerMessage, CommandReply, DispatchError};
use courier_telemetry::MetricsRecorder;

use crate::correlator::{CorrelatorError, ReplyCorrelator, WaitOutcome};
use crate::registry::ConnectionRegistry;

/// Default bound on how long a controller waits for an agent's reply.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends a command to one agent and waits for its correlated reply.
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<ReplyCorrelator>,
    metrics: Arc<MetricsRecorder>,
    default_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        correlator: Arc<ReplyCorrelator>,
        metrics: Arc<MetricsRecorder>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            correlator,
            metrics,
            default_timeout,
        }
    }

    /// Push `command` to `agent_id` and wait up to `timeout` (or the default)
    /// for the reply. Only one command per agent may be in flight; a second
    /// caller fails immediately instead of queueing.
    pub async fn dispatch(
        &self,
        agent_id: &AgentId,
        command: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<CommandReply, DispatchError> {
        let start = Instant::now();
        let timeout = timeout.unwrap_or(self.default_timeout);
        let result = self.dispatch_inner(agent_id, command, timeout).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.error_kind(),
        };
        self.metrics
            .counter_inc("courier.dispatch.total", &[("outcome", outcome)], 1);
        self.metrics.histogram_observe(
            "courier.dispatch.latency_ms",
            &[],
            start.elapsed().as_secs_f64() * 1000.0,
        );

        match &result {
            Ok(_) => tracing::debug!(agent_id = %agent_id, elapsed_ms = start.elapsed().as_millis() as u64, "Command answered"),
            Err(e) => tracing::warn!(agent_id = %agent_id, kind = e.error_kind(), "Command failed: {e}"),
        }
        result
    }

    async fn dispatch_inner(
        &self,
        agent_id: &AgentId,
        command: serde_json::Value,
        timeout: Duration,
    ) -> Result<CommandReply, DispatchError> {
        let session = self
            .registry
            .lookup(agent_id)
            .ok_or_else(|| DispatchError::AgentNotConnected(agent_id.clone()))?;

        let waiter = self
            .correlator
            .create_waiter(agent_id.clone())
            .map_err(|CorrelatorError::DuplicateKey| {
                DispatchError::CommandAlreadyInFlight(agent_id.clone())
            })?;

        if let Err(e) = session.push(BrokerMessage::Command { payload: command }) {
            // Withdraws the waiter before anyone could have resolved it.
            drop(waiter);
            return Err(DispatchError::DeliveryFailed {
                agent_id: agent_id.clone(),
                reason: e.to_string(),
            });
        }
        tracing::debug!(agent_id = %agent_id, timeout_ms = timeout.as_millis() as u64, "Command sent, waiting for reply");

        match waiter.wait(timeout).await {
            WaitOutcome::Resolved(reply) => Ok(reply),
            WaitOutcome::TimedOut => Err(DispatchError::Timeout {
                agent_id: agent_id.clone(),
                timeout,
            }),
            WaitOutcome::Disconnected => Err(DispatchError::AgentDisconnected(agent_id.clone())),
        }
    }
}

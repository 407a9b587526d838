//! RPC method handlers.

use std::time::Duration;

use courier_broker::{Broker, ForwardResponse};
use courier_core::AgentId;

use crate::compat;
use crate::rpc::{self, RpcResponse};

/// Dispatch an RPC method to the appropriate handler.
///
/// Normalizes camelCase params to snake_case before routing.
pub async fn dispatch(
    broker: &Broker,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params = compat::normalize_params(params);

    match method {
        "broker.forward" | "forwardToClient" => forward(broker, &params, id).await,
        "agents.list" => agents_list(broker, id),
        "system.health" | "health" => health(broker, id),
        "metrics.snapshot" => metrics_snapshot(broker, id),
        _ => RpcResponse::method_not_found(id, method),
    }
}

async fn forward(
    broker: &Broker,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let agent_id = match rpc::require_str(params, "agent_id") {
        Ok(s) if !s.is_empty() => AgentId::from(s),
        Ok(_) => return RpcResponse::invalid_params(id, "agent_id must not be empty"),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let command = match rpc::require_value(params, "command") {
        Ok(v) => v.clone(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let timeout = match rpc::optional_u64(params, "timeout_ms") {
        Ok(ms) => ms.map(Duration::from_millis),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let result = broker.dispatch(&agent_id, command, timeout).await;
    match result {
        Ok(reply) => {
            let response = ForwardResponse::from_result(agent_id, Ok(reply));
            to_result(id, &response)
        }
        Err(e) => {
            let code = e.code();
            let message = e.to_string();
            let response = ForwardResponse::from_result(agent_id, Err(e));
            let data = serde_json::to_value(&response).unwrap_or_default();
            RpcResponse::error(id, code, message).with_data(data)
        }
    }
}

fn agents_list(broker: &Broker, id: Option<serde_json::Value>) -> RpcResponse {
    let agents = broker.agents();
    let count = agents.len();
    match serde_json::to_value(agents) {
        Ok(agents) => RpcResponse::success(
            id,
            serde_json::json!({
                "agents": agents,
                "totalCount": count,
            }),
        ),
        Err(e) => RpcResponse::internal_error(id, format!("Failed to list agents: {e}")),
    }
}

fn health(broker: &Broker, id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(id, health_status(broker))
}

/// Shared by the RPC method and the plain HTTP endpoint.
pub fn health_status(broker: &Broker) -> serde_json::Value {
    serde_json::json!({
        "status": "healthy",
        "agents": broker.registry().len(),
        "pending": broker.pending(),
    })
}

fn metrics_snapshot(broker: &Broker, id: Option<serde_json::Value>) -> RpcResponse {
    let snapshot = broker.metrics().snapshot();
    to_result(id, &snapshot)
}

fn to_result<T: serde::Serialize>(id: Option<serde_json::Value>, value: &T) -> RpcResponse {
    match serde_json::to_value(value) {
        Ok(v) => RpcResponse::success(id, v),
        Err(e) => RpcResponse::internal_error(id, format!("Failed to encode result: {e}")),
    }
}

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use courier_broker::{Broker, BrokerConfig};
use courier_telemetry::MetricsRecorder;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::connection;
use crate::handlers;
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub max_send_queue: usize,
    /// Default wait for an agent's reply when the caller gives none.
    pub command_timeout: Duration,
    pub ping_interval: Duration,
    /// Upper bound on any single HTTP request, including a forwarded command.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9091,
            max_send_queue: 256,
            command_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            command_timeout: self.command_timeout,
            send_queue: self.max_send_queue,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    pub ping_interval: Duration,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/agents/connect", get(agent_ws_handler))
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle to reach the broker and shut
/// the server down.
pub async fn start(
    config: ServerConfig,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let broker = Broker::with_metrics(config.broker_config(), metrics);
    let shutdown = CancellationToken::new();

    let state = AppState {
        broker: broker.clone(),
        ping_interval: config.ping_interval,
        shutdown: shutdown.clone(),
    };
    let router = build_router(state, config.request_timeout);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        addr = %local_addr,
        command_timeout_ms = config.command_timeout.as_millis() as u64,
        "Courier server started"
    );

    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "Server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        broker,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    broker: Broker,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Stop accepting connections, close agent streams and wait for the
    /// listener to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "Server task did not finish cleanly");
        }
        tracing::info!("Courier server stopped");
    }
}

/// WebSocket upgrade for agents.
async fn agent_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_agent_socket(socket, state.broker, state.ping_interval, state.shutdown)
    })
}

/// Controller RPC endpoint.
async fn rpc_handler(State(state): State<AppState>, body: String) -> Json<RpcResponse> {
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::debug!(error = %e, "Rejecting unparseable RPC request");
            return Json(RpcResponse::parse_error());
        }
    };

    let params = request.params.unwrap_or(serde_json::json!({}));
    Json(handlers::dispatch(&state.broker, &request.method, &params, request.id).await)
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(handlers::health_status(&state.broker))
}

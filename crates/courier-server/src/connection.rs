use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use courier_broker::Broker;
use courier_core::{AgentMessage, BrokerMessage, ConnectionId};
use futures::{future, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Serve one agent WebSocket until either side goes away or the server shuts
/// down. The broker's handler owns registration and cleanup; this function
/// only moves frames.
pub async fn handle_agent_socket(
    socket: WebSocket,
    broker: Broker,
    ping_interval: Duration,
    shutdown: CancellationToken,
) {
    let (mut handler, outbound) = broker.open_stream();
    let connection_id = handler.connection_id().clone();
    tracing::info!(connection_id = %connection_id, "Agent stream opened");

    let (ws_tx, ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_frames(
        ws_tx,
        outbound,
        ping_interval,
        connection_id.clone(),
    ));

    let inbound = agent_messages(ws_rx, connection_id.clone());
    tokio::select! {
        _ = handler.run(inbound) => {}
        _ = &mut writer => {
            tracing::debug!(connection_id = %connection_id, "Writer finished first");
        }
        _ = shutdown.cancelled() => {
            tracing::debug!(connection_id = %connection_id, "Server shutting down");
        }
    }

    writer.abort();
    handler.close();
}

/// Forward queued broker messages to the socket and keep it alive with pings.
async fn write_frames<S>(
    mut ws_tx: S,
    mut outbound: mpsc::Receiver<BrokerMessage>,
    ping_interval: Duration,
    connection_id: ConnectionId,
) where
    S: futures::Sink<WsMessage> + Unpin,
{
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(connection_id = %connection_id, error = %e, "Failed to encode outbound message");
                        continue;
                    }
                };
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                tracing::trace!(connection_id = %connection_id, "Sent ping");
            }
        }
    }

    let _ = ws_tx.close().await;
}

/// Decode socket frames into agent messages. Ends at the first transport
/// error or close frame; malformed frames are logged and skipped.
fn agent_messages<S, E>(ws_rx: S, connection_id: ConnectionId) -> impl Stream<Item = AgentMessage>
where
    S: Stream<Item = Result<WsMessage, E>>,
{
    ws_rx
        .take_while(|frame| {
            future::ready(!matches!(frame, Err(_) | Ok(WsMessage::Close(_))))
        })
        .filter_map(move |frame| {
            let parsed = match frame {
                Ok(WsMessage::Text(text)) => parse_frame(text.as_str(), &connection_id),
                Ok(WsMessage::Binary(_)) => {
                    tracing::warn!(connection_id = %connection_id, "Ignoring binary frame");
                    None
                }
                _ => None,
            };
            future::ready(parsed)
        })
}

fn parse_frame(text: &str, connection_id: &ConnectionId) -> Option<AgentMessage> {
    match serde_json::from_str(text) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(
                connection_id = %connection_id,
                error = %e,
                frame_len = text.len(),
                "Skipping malformed agent frame"
            );
            None
        }
    }
}

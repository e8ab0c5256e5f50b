//! WebSocket endpoints for both client populations.
//!
//! `/mcp_endpoint/mcp/` accepts tool servers, `/mcp_endpoint/call/` accepts
//! callers. Both authenticate through a `token` query parameter carrying a
//! URL-encoded `{"agentId": …}` object; tool servers additionally name
//! themselves with a `server_id` parameter. A socket that fails either check
//! is closed with a policy-violation frame.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ToolServerQuery {
    token: Option<String>,
    server_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallerQuery {
    token: Option<String>,
}

pub async fn tool_server_handler(
    State(state): State<AppState>,
    Query(query): Query<ToolServerQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_tool_server_socket(state, socket, query))
}

pub async fn caller_handler(
    State(state): State<AppState>,
    Query(query): Query<CallerQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_caller_socket(state, socket, query))
}

async fn handle_tool_server_socket(state: AppState, socket: WebSocket, query: ToolServerQuery) {
    let Some(agent_id) = query.token.as_deref().and_then(auth::agent_id_from_token) else {
        close_policy_violation(socket, "missing or invalid token").await;
        return;
    };
    let Some(server_id) = query.server_id.filter(|server_id| !server_id.is_empty()) else {
        close_policy_violation(socket, "missing server_id parameter").await;
        return;
    };

    let (tx, rx) = spawn_writer(socket);

    let connection_uuid = state
        .registry
        .register_tool_server(&agent_id, &server_id, tx.clone());

    let established = json!({
        "type": "connection_established",
        "message": "tool server connection established",
        "agent_id": agent_id,
        "server_id": server_id,
    });
    if tx.send(Message::Text(established.to_string())).is_err() {
        state
            .registry
            .release_tool_server(&agent_id, &server_id, &connection_uuid);
        return;
    }

    state.router.start_tool_handshake(&agent_id, &server_id);

    let mut receiver = rx;
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.registry.touch_tool_server(&agent_id, &server_id);
                state.router.handle_tool_message(&agent_id, &server_id, &text);
            }
            Ok(Message::Ping(data)) => {
                state.registry.touch_tool_server(&agent_id, &server_id);
                if tx.send(Message::Pong(data)).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                info!("tool server {}/{} closed the connection", agent_id, server_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(
                    "websocket error on tool server {}/{}: {}",
                    agent_id, server_id, e
                );
                break;
            }
        }
    }

    state
        .registry
        .release_tool_server(&agent_id, &server_id, &connection_uuid);
}

async fn handle_caller_socket(state: AppState, socket: WebSocket, query: CallerQuery) {
    let Some(agent_id) = query.token.as_deref().and_then(auth::agent_id_from_token) else {
        close_policy_violation(socket, "missing or invalid token").await;
        return;
    };

    let (tx, rx) = spawn_writer(socket);

    let connection_uuid = state.registry.register_caller(&agent_id, tx.clone());

    let established = json!({
        "type": "connection_established",
        "message": "caller connection established",
        "agent_id": agent_id,
    });
    if tx.send(Message::Text(established.to_string())).is_err() {
        state.registry.unregister_caller(&connection_uuid);
        return;
    }

    let mut receiver = rx;
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.registry.touch_caller(&connection_uuid);
                state
                    .router
                    .handle_caller_message(&agent_id, &connection_uuid, &text);
            }
            Ok(Message::Ping(data)) => {
                state.registry.touch_caller(&connection_uuid);
                if tx.send(Message::Pong(data)).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                info!("caller {} closed the connection", connection_uuid);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("websocket error on caller {}: {}", connection_uuid, e);
                break;
            }
        }
    }

    state.registry.unregister_caller(&connection_uuid);
}

type SocketReader = futures_util::stream::SplitStream<WebSocket>;

/// Split a socket and spawn the writer task that owns its write half. Every
/// send to this connection goes through the returned channel.
fn spawn_writer(socket: WebSocket) -> (mpsc::UnboundedSender<Message>, SocketReader) {
    let (mut sender, receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    (tx, receiver)
}

async fn close_policy_violation(mut socket: WebSocket, reason: &'static str) {
    warn!("rejecting websocket connection: {}", reason);
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("failed to send policy-violation close frame: {}", e);
    }
}

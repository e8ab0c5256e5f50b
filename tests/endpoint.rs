//! End-to-end tests against a server bound to an ephemeral port, driving
//! real WebSocket clients through both endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use mcp_endpoint_server::config::Config;
use mcp_endpoint_server::registry::ConnectionRegistry;
use mcp_endpoint_server::server::{build_router, AppState};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_server() -> (SocketAddr, Arc<ConnectionRegistry>) {
    let mut config = Config::default();
    config.server.key = "test-key".to_string();

    let state = AppState::new(config);
    let registry = Arc::clone(&state.registry);
    let app = build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    (addr, registry)
}

fn percent_encode(raw: &str) -> String {
    let mut encoded = String::new();
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

fn token_for(agent_id: &str) -> String {
    percent_encode(&json!({ "agentId": agent_id }).to_string())
}

async fn recv_json(ws: &mut WsClient) -> Value {
    loop {
        let frame = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("invalid JSON frame");
        }
    }
}

async fn recv_close(ws: &mut WsClient) -> tokio_tungstenite::tungstenite::protocol::CloseFrame<'static> {
    loop {
        let frame = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Close(frame) = frame {
            return frame.expect("close frame carries code and reason");
        }
    }
}

async fn connect_tool_server(addr: SocketAddr, agent_id: &str, server_id: &str) -> WsClient {
    let url = format!(
        "ws://{}/mcp_endpoint/mcp/?token={}&server_id={}",
        addr,
        token_for(agent_id),
        server_id
    );
    let (mut ws, _) = connect_async(url).await.expect("tool server connect");
    let established = recv_json(&mut ws).await;
    assert_eq!(established["type"], "connection_established");
    assert_eq!(established["agent_id"], agent_id);
    assert_eq!(established["server_id"], server_id);
    ws
}

async fn connect_caller(addr: SocketAddr, agent_id: &str) -> WsClient {
    let url = format!(
        "ws://{}/mcp_endpoint/call/?token={}",
        addr,
        token_for(agent_id)
    );
    let (mut ws, _) = connect_async(url).await.expect("caller connect");
    let established = recv_json(&mut ws).await;
    assert_eq!(established["type"], "connection_established");
    ws
}

/// Answer the router-initiated handshake and publish a tool catalog.
async fn complete_handshake(ws: &mut WsClient, tools: Value) {
    let initialize = recv_json(ws).await;
    assert_eq!(initialize["method"], "initialize");
    assert!(initialize["params"]["protocolVersion"].is_string());

    ws.send(Message::Text(
        json!({
            "jsonrpc": "2.0",
            "id": initialize["id"],
            "result": {
                "protocolVersion": "2024-11-05",
                "serverInfo": {"name": "test-server", "version": "0.0.1"},
            }
        })
        .to_string(),
    ))
    .await
    .expect("send initialize response");

    loop {
        let frame = recv_json(ws).await;
        if frame["method"] == "notifications/initialized" {
            continue;
        }
        assert_eq!(frame["method"], "tools/list");
        ws.send(Message::Text(
            json!({
                "jsonrpc": "2.0",
                "id": frame["id"],
                "result": { "tools": tools },
            })
            .to_string(),
        ))
        .await
        .expect("send tools/list response");
        break;
    }
}

async fn wait_for_tool(registry: &ConnectionRegistry, agent_id: &str, tool_name: &str) {
    for _ in 0..250 {
        if registry.find_tool_server(agent_id, tool_name).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("tool {} never appeared in the catalog", tool_name);
}

#[tokio::test]
async fn single_server_roundtrip() {
    let (addr, registry) = spawn_server().await;

    let mut tool = connect_tool_server(addr, "agentA", "srv1").await;
    complete_handshake(
        &mut tool,
        json!([{ "name": "calc", "description": "calculator" }]),
    )
    .await;
    wait_for_tool(&registry, "agentA", "calc").await;

    let mut caller = connect_caller(addr, "agentA").await;
    caller
        .send(Message::Text(
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "tools/call",
                "params": {"name": "calc", "arguments": {"x": 1}}
            })
            .to_string(),
        ))
        .await
        .expect("send tools/call");

    let forwarded = recv_json(&mut tool).await;
    assert_eq!(forwarded["method"], "tools/call");
    assert_eq!(forwarded["params"]["arguments"]["x"], 1);
    let rewritten = forwarded["id"].as_str().expect("rewritten id is a string");
    assert!(
        rewritten.ends_with("_n_7"),
        "unexpected rewritten id: {}",
        rewritten
    );

    tool.send(Message::Text(
        json!({
            "jsonrpc": "2.0",
            "id": rewritten,
            "result": { "content": [{"type": "text", "text": "ok"}] },
        })
        .to_string(),
    ))
    .await
    .expect("send tool result");

    let reply = recv_json(&mut caller).await;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["result"]["content"][0]["type"], "text");
    assert_eq!(reply["result"]["content"][0]["text"], "ok");
    assert_eq!(reply["result"]["total_servers"], 1);
    assert_eq!(reply["result"]["responded_servers"], 1);
}

#[tokio::test]
async fn displacement_closes_the_previous_socket() {
    let (addr, _registry) = spawn_server().await;

    let mut first = connect_tool_server(addr, "agentA", "srv1").await;
    // drain the handshake request so only the close frame remains
    let initialize = recv_json(&mut first).await;
    assert_eq!(initialize["method"], "initialize");

    let _second = connect_tool_server(addr, "agentA", "srv1").await;

    let close = recv_close(&mut first).await;
    assert_eq!(u16::from(close.code), 1000);
    assert_eq!(close.reason, "connection replaced");
}

#[tokio::test]
async fn missing_token_is_rejected_with_policy_violation() {
    let (addr, _registry) = spawn_server().await;

    let (mut ws, _) = connect_async(format!("ws://{}/mcp_endpoint/mcp/?server_id=srv1", addr))
        .await
        .expect("connect");
    let close = recv_close(&mut ws).await;
    assert_eq!(u16::from(close.code), 1008);
}

#[tokio::test]
async fn missing_server_id_is_rejected_with_policy_violation() {
    let (addr, _registry) = spawn_server().await;

    let (mut ws, _) = connect_async(format!(
        "ws://{}/mcp_endpoint/mcp/?token={}",
        addr,
        token_for("agentA")
    ))
    .await
    .expect("connect");
    let close = recv_close(&mut ws).await;
    assert_eq!(u16::from(close.code), 1008);
    assert_eq!(close.reason, "missing server_id parameter");
}

#[tokio::test]
async fn health_endpoint_requires_the_static_key() {
    let (addr, _registry) = spawn_server().await;

    let ok: Value = reqwest::get(format!("http://{}/mcp_endpoint/health?key=test-key", addr))
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");
    assert_eq!(ok["status"], "success");
    assert_eq!(ok["connections"]["total_connections"], 0);

    let bad: Value = reqwest::get(format!("http://{}/mcp_endpoint/health?key=wrong", addr))
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");
    assert_eq!(bad["status"], "key_error");
    assert!(bad.get("connections").is_none());
}

#[tokio::test]
async fn caller_requests_reach_the_replacement_after_displacement() {
    let (addr, registry) = spawn_server().await;

    let mut first = connect_tool_server(addr, "agentA", "srv1").await;
    complete_handshake(&mut first, json!([{ "name": "old" }])).await;
    wait_for_tool(&registry, "agentA", "old").await;

    let mut second = connect_tool_server(addr, "agentA", "srv1").await;
    complete_handshake(&mut second, json!([{ "name": "calc" }])).await;
    wait_for_tool(&registry, "agentA", "calc").await;

    let mut caller = connect_caller(addr, "agentA").await;
    caller
        .send(Message::Text(
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": {"name": "calc"}
            })
            .to_string(),
        ))
        .await
        .expect("send tools/call");

    // the replacement socket receives the request
    let forwarded = recv_json(&mut second).await;
    assert_eq!(forwarded["method"], "tools/call");
    assert_eq!(forwarded["params"]["name"], "calc");
}

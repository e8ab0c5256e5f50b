//! Live connection state for both client populations.
//!
//! Tool servers are keyed by `(agent_id, server_id)` and displaced on
//! re-registration; callers are keyed by a per-connection UUID and coexist
//! freely under one agent. Each entry owns the write half of its socket
//! through an unbounded channel drained by a writer task.

mod catalog;
pub mod pending;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pending::PendingResponse;

/// One live tool-server connection.
#[derive(Debug)]
pub struct ToolServerConnection {
    pub agent_id: String,
    pub server_id: String,
    pub connection_uuid: String,
    pub sender: mpsc::UnboundedSender<Message>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
    /// Stamped tool descriptors in catalog order.
    pub tools: Vec<Value>,
    pub server_info: Value,
}

/// One live caller connection.
#[derive(Debug)]
pub struct CallerConnection {
    pub agent_id: String,
    pub connection_uuid: String,
    pub sender: mpsc::UnboundedSender<Message>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
}

/// Registry of every live connection plus the in-flight fan-out
/// correlations. Explicitly constructed and threaded through the handlers.
pub struct ConnectionRegistry {
    tool_servers: DashMap<(String, String), ToolServerConnection>,
    callers: DashMap<String, CallerConnection>,
    pending: DashMap<String, PendingResponse>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            tool_servers: DashMap::new(),
            callers: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Register a tool-server connection. An existing connection for the
    /// same `(agent_id, server_id)` is closed and replaced.
    pub fn register_tool_server(
        &self,
        agent_id: &str,
        server_id: &str,
        sender: mpsc::UnboundedSender<Message>,
    ) -> String {
        let connection = ToolServerConnection {
            agent_id: agent_id.to_string(),
            server_id: server_id.to_string(),
            connection_uuid: Uuid::new_v4().to_string(),
            sender,
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            tools: Vec::new(),
            server_info: Value::Null,
        };
        let connection_uuid = connection.connection_uuid.clone();

        let key = (agent_id.to_string(), server_id.to_string());
        if let Some(old) = self.tool_servers.insert(key, connection) {
            warn!(
                "replacing tool server connection {}/{} (uuid {})",
                agent_id, server_id, old.connection_uuid
            );
            let close = Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "connection replaced".into(),
            }));
            if old.sender.send(close).is_err() {
                debug!(
                    "displaced tool server {}/{} already closed",
                    agent_id, server_id
                );
            }
        }

        info!(
            "tool server connected: {}/{} (uuid {})",
            agent_id, server_id, connection_uuid
        );
        connection_uuid
    }

    /// Register a caller connection and mint its UUID. Never displaces.
    pub fn register_caller(&self, agent_id: &str, sender: mpsc::UnboundedSender<Message>) -> String {
        let connection = CallerConnection {
            agent_id: agent_id.to_string(),
            connection_uuid: Uuid::new_v4().to_string(),
            sender,
            connected_at: Utc::now(),
            last_activity: Instant::now(),
        };
        let connection_uuid = connection.connection_uuid.clone();
        self.callers.insert(connection_uuid.clone(), connection);
        info!("caller connected: {} (uuid {})", agent_id, connection_uuid);
        connection_uuid
    }

    /// Remove a tool-server entry only if it still belongs to the given
    /// connection, so a displaced socket's teardown cannot evict its
    /// replacement. Idempotent.
    pub fn release_tool_server(&self, agent_id: &str, server_id: &str, connection_uuid: &str) {
        let key = (agent_id.to_string(), server_id.to_string());
        let removed = self
            .tool_servers
            .remove_if(&key, |_, conn| conn.connection_uuid == connection_uuid);
        if removed.is_some() {
            info!("tool server disconnected: {}/{}", agent_id, server_id);
        }
    }

    /// Remove a tool-server entry unconditionally. Idempotent.
    pub fn unregister_tool_server(&self, agent_id: &str, server_id: &str) {
        let key = (agent_id.to_string(), server_id.to_string());
        if self.tool_servers.remove(&key).is_some() {
            info!("tool server unregistered: {}/{}", agent_id, server_id);
        }
    }

    /// Remove a caller and purge its outstanding correlations. Idempotent.
    pub fn unregister_caller(&self, connection_uuid: &str) {
        if let Some((_, connection)) = self.callers.remove(connection_uuid) {
            info!(
                "caller disconnected: {} (uuid {})",
                connection.agent_id, connection_uuid
            );
        }
        self.purge_pending_for_caller(connection_uuid);
    }

    /// Serialize and send a message to one tool server. Returns `false` when
    /// the connection is missing or the send fails; a failed send (the
    /// writer task is gone, so the socket is closed) also unregisters.
    pub fn send_to_tool_server(&self, agent_id: &str, server_id: &str, message: &Value) -> bool {
        let key = (agent_id.to_string(), server_id.to_string());
        let sender = match self.tool_servers.get(&key) {
            Some(connection) => connection.sender.clone(),
            None => {
                warn!("tool server not connected: {}/{}", agent_id, server_id);
                return false;
            }
        };

        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                error!(
                    "failed to serialize message for tool server {}/{}: {}",
                    agent_id, server_id, e
                );
                return false;
            }
        };

        if sender.send(Message::Text(text)).is_err() {
            warn!(
                "tool server connection closed during send: {}/{}",
                agent_id, server_id
            );
            self.unregister_tool_server(agent_id, server_id);
            return false;
        }
        true
    }

    /// Serialize and send a message to one caller connection. Same contract
    /// as [`send_to_tool_server`](Self::send_to_tool_server).
    pub fn send_to_caller(&self, connection_uuid: &str, message: &Value) -> bool {
        let sender = match self.callers.get(connection_uuid) {
            Some(connection) => connection.sender.clone(),
            None => {
                warn!("caller not connected: {}", connection_uuid);
                return false;
            }
        };

        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                error!(
                    "failed to serialize message for caller {}: {}",
                    connection_uuid, e
                );
                return false;
            }
        };

        if sender.send(Message::Text(text)).is_err() {
            warn!("caller connection closed during send: {}", connection_uuid);
            self.unregister_caller(connection_uuid);
            return false;
        }
        true
    }

    pub fn is_tool_server_connected(&self, agent_id: &str, server_id: &str) -> bool {
        self.tool_servers
            .contains_key(&(agent_id.to_string(), server_id.to_string()))
    }

    pub fn is_caller_connected(&self, agent_id: &str) -> bool {
        self.callers
            .iter()
            .any(|entry| entry.value().agent_id == agent_id)
    }

    pub fn is_caller_uuid_connected(&self, connection_uuid: &str) -> bool {
        self.callers.contains_key(connection_uuid)
    }

    /// Server ids of one agent, in registration order.
    pub fn agent_servers(&self, agent_id: &str) -> Vec<String> {
        let mut servers: Vec<(DateTime<Utc>, String)> = self
            .tool_servers
            .iter()
            .filter(|entry| entry.key().0 == agent_id)
            .map(|entry| (entry.value().connected_at, entry.value().server_id.clone()))
            .collect();
        servers.sort();
        servers.into_iter().map(|(_, server_id)| server_id).collect()
    }

    /// Caller connection UUIDs of one agent.
    pub fn callers_of(&self, agent_id: &str) -> Vec<String> {
        self.callers
            .iter()
            .filter(|entry| entry.value().agent_id == agent_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Every agent id with at least one tool server connected.
    pub fn available_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .tool_servers
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        agents.sort();
        agents.dedup();
        agents
    }

    pub fn touch_tool_server(&self, agent_id: &str, server_id: &str) {
        let key = (agent_id.to_string(), server_id.to_string());
        if let Some(mut connection) = self.tool_servers.get_mut(&key) {
            connection.last_activity = Instant::now();
        }
    }

    pub fn touch_caller(&self, connection_uuid: &str) {
        if let Some(mut connection) = self.callers.get_mut(connection_uuid) {
            connection.last_activity = Instant::now();
        }
    }

    /// Connection statistics for the health endpoint.
    pub fn stats(&self) -> Value {
        let mut callers_by_agent: HashMap<String, u64> = HashMap::new();
        for entry in self.callers.iter() {
            *callers_by_agent
                .entry(entry.value().agent_id.clone())
                .or_insert(0) += 1;
        }

        let mut tool_server_stats = serde_json::Map::new();
        let mut total_tool_servers = 0usize;
        let mut total_tools = 0usize;
        for entry in self.tool_servers.iter() {
            let connection = entry.value();
            total_tool_servers += 1;
            total_tools += connection.tools.len();

            let tool_names: Vec<Value> = connection
                .tools
                .iter()
                .filter_map(|tool| tool.get("name").cloned())
                .collect();
            let server_entry = json!({
                "tools_count": connection.tools.len(),
                "tools": tool_names,
                "server_info": connection.server_info,
            });

            let agent_entry = tool_server_stats
                .entry(connection.agent_id.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Some(agent_map) = agent_entry.as_object_mut() {
                agent_map.insert(connection.server_id.clone(), server_entry);
            }
        }

        json!({
            "tool_server_connections": total_tool_servers,
            "caller_connections": self.callers.len(),
            "total_connections": total_tool_servers + self.callers.len(),
            "caller_connections_by_agent": callers_by_agent,
            "tool_servers": Value::Object(tool_server_stats),
            "total_tools": total_tools,
        })
    }

    /// Close connections whose last activity is older than `idle_timeout`.
    /// Returns the number of connections closed.
    pub fn sweep_idle(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();

        let idle_tool_servers: Vec<(String, String, String)> = self
            .tool_servers
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_activity) > idle_timeout)
            .map(|entry| {
                (
                    entry.value().agent_id.clone(),
                    entry.value().server_id.clone(),
                    entry.value().connection_uuid.clone(),
                )
            })
            .collect();

        let idle_callers: Vec<String> = self
            .callers
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_activity) > idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = 0;
        for (agent_id, server_id, connection_uuid) in idle_tool_servers {
            warn!("closing idle tool server connection: {}/{}", agent_id, server_id);
            let key = (agent_id.clone(), server_id.clone());
            if let Some(connection) = self.tool_servers.get(&key) {
                let _ = connection.sender.send(idle_close_frame());
            }
            self.release_tool_server(&agent_id, &server_id, &connection_uuid);
            closed += 1;
        }
        for connection_uuid in idle_callers {
            warn!("closing idle caller connection: {}", connection_uuid);
            if let Some(connection) = self.callers.get(&connection_uuid) {
                let _ = connection.sender.send(idle_close_frame());
            }
            self.unregister_caller(&connection_uuid);
            closed += 1;
        }
        closed
    }
}

fn idle_close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "idle timeout".into(),
    }))
}

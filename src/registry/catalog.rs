//! Tool catalog operations layered on the registry.
//!
//! Each tool-server connection holds its own `tools` slice as the single
//! source of truth; lookups scan the servers of an agent in registration
//! order.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use super::ConnectionRegistry;

impl ConnectionRegistry {
    /// Replace the cached catalog of one tool server. Every descriptor is
    /// stamped with the owning `server_id`; duplicate names keep the last
    /// occurrence. Descriptors without a `name` cannot be resolved and are
    /// dropped.
    pub fn update_tool_list(&self, agent_id: &str, server_id: &str, tools: &[Value]) {
        let mut stamped: Vec<Value> = Vec::with_capacity(tools.len());
        for tool in tools {
            let mut tool = tool.clone();
            let Some(descriptor) = tool.as_object_mut() else {
                debug!(
                    "dropping non-object tool descriptor from {}/{}",
                    agent_id, server_id
                );
                continue;
            };
            descriptor.insert("server_id".to_string(), Value::String(server_id.to_string()));

            let Some(name) = descriptor.get("name").and_then(Value::as_str).map(str::to_string)
            else {
                debug!(
                    "dropping unnamed tool descriptor from {}/{}",
                    agent_id, server_id
                );
                continue;
            };

            match stamped
                .iter_mut()
                .find(|existing| existing.get("name").and_then(Value::as_str) == Some(name.as_str()))
            {
                Some(existing) => *existing = tool,
                None => stamped.push(tool),
            }
        }

        let key = (agent_id.to_string(), server_id.to_string());
        if let Some(mut connection) = self.tool_servers.get_mut(&key) {
            info!(
                "updated tool list for {}/{}: {} tools",
                agent_id,
                server_id,
                stamped.len()
            );
            connection.tools = stamped;
        }
    }

    /// Stash the `initialize` result of one tool server.
    pub fn update_server_info(&self, agent_id: &str, server_id: &str, server_info: Value) {
        let key = (agent_id.to_string(), server_id.to_string());
        if let Some(mut connection) = self.tool_servers.get_mut(&key) {
            info!("updated server info for {}/{}", agent_id, server_id);
            connection.server_info = server_info;
        }
    }

    /// Resolve a tool name to the server that publishes it. The first match
    /// in registration order wins.
    pub fn find_tool_server(&self, agent_id: &str, tool_name: &str) -> Option<String> {
        let mut matches: Vec<(DateTime<Utc>, String)> = self
            .tool_servers
            .iter()
            .filter(|entry| entry.key().0 == agent_id)
            .filter(|entry| {
                entry
                    .value()
                    .tools
                    .iter()
                    .any(|tool| tool.get("name").and_then(Value::as_str) == Some(tool_name))
            })
            .map(|entry| (entry.value().connected_at, entry.value().server_id.clone()))
            .collect();
        matches.sort();
        matches.into_iter().next().map(|(_, server_id)| server_id)
    }

    /// All tools of one agent, flattened across its servers in registration
    /// order, each descriptor carrying its stamped `server_id`.
    pub fn all_tools(&self, agent_id: &str) -> Vec<Value> {
        let mut per_server: Vec<(DateTime<Utc>, Vec<Value>)> = self
            .tool_servers
            .iter()
            .filter(|entry| entry.key().0 == agent_id)
            .map(|entry| (entry.value().connected_at, entry.value().tools.clone()))
            .collect();
        per_server.sort_by_key(|(connected_at, _)| *connected_at);
        per_server
            .into_iter()
            .flat_map(|(_, tools)| tools)
            .collect()
    }
}

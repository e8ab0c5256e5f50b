//! Fan-out/fan-in request coordination between callers and tool servers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::rewrite;
use super::types;
use crate::registry::pending::{aggregate_responses, PendingOutcome, PendingResponse};
use crate::registry::ConnectionRegistry;

/// Seconds between maintenance passes over the pending table and the idle
/// connections.
const SWEEP_INTERVAL_SECS: u64 = 10;

/// Ids of the router-initiated handshake toward a tool server. Plain
/// numbers, so they can never collide with a rewritten caller id.
const INITIALIZE_REQUEST_ID: i64 = 1;
const TOOLS_LIST_REQUEST_ID: i64 = 2;

/// Routes caller requests to tool servers and tool-server responses back to
/// the caller that issued them.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Open the MCP handshake toward a freshly registered tool server. The
    /// catalog fills in lazily as the responses arrive.
    pub fn start_tool_handshake(&self, agent_id: &str, server_id: &str) {
        let initialize = types::request_frame(
            json!(INITIALIZE_REQUEST_ID),
            "initialize",
            json!({
                "protocolVersion": types::MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "mcp-endpoint-server",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        );
        if !self
            .registry
            .send_to_tool_server(agent_id, server_id, &initialize)
        {
            warn!(
                "failed to open handshake with tool server {}/{}",
                agent_id, server_id
            );
        }
    }

    /// Handle one text frame from a caller socket.
    pub fn handle_caller_message(&self, agent_id: &str, caller_uuid: &str, raw: &str) {
        let message: Value = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping non-JSON frame from caller {}: {}", caller_uuid, e);
                return;
            }
        };

        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);

        let Some(method) = method else {
            if id.is_null() {
                debug!("dropping frame without method from caller {}", caller_uuid);
            } else {
                self.reply_error(caller_uuid, id, types::INVALID_REQUEST, "invalid JSON-RPC request");
            }
            return;
        };

        match method.as_str() {
            "tools/call" => self.route_tool_call(agent_id, caller_uuid, &message, id),
            // tools/list takes the generic path so the caller sees the same
            // aggregated shape whether or not a catalog cache exists
            _ => self.fan_out(agent_id, caller_uuid, &message, id),
        }
    }

    /// Route a `tools/call` to the single server publishing the tool.
    fn route_tool_call(&self, agent_id: &str, caller_uuid: &str, message: &Value, id: Value) {
        let tool_name = message
            .get("params")
            .and_then(|params| params.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let Some(tool_name) = tool_name else {
            warn!("tools/call without a tool name from caller {}", caller_uuid);
            if !id.is_null() {
                self.reply_error(
                    caller_uuid,
                    id,
                    types::INVALID_PARAMS,
                    "missing required parameter: name",
                );
            }
            return;
        };

        if self.registry.agent_servers(agent_id).is_empty() {
            if !id.is_null() {
                self.reply_error(
                    caller_uuid,
                    id,
                    types::TOOL_NOT_CONNECTED,
                    "no tool server connected for agent",
                );
            }
            return;
        }

        let Some(server_id) = self.registry.find_tool_server(agent_id, &tool_name) else {
            if !id.is_null() {
                self.reply_error(
                    caller_uuid,
                    id,
                    types::METHOD_NOT_FOUND,
                    &format!("tool not found: {}", tool_name),
                );
            }
            return;
        };

        if !self.registry.is_tool_server_connected(agent_id, &server_id) {
            if !id.is_null() {
                self.reply_error(
                    caller_uuid,
                    id,
                    types::TOOL_NOT_CONNECTED,
                    &format!("tool server not connected: {}", server_id),
                );
            }
            return;
        }

        let forwarded = rewrite::transform_message(message, caller_uuid);
        if id.is_null() {
            // notification: forward without tracking, never answer
            self.registry
                .send_to_tool_server(agent_id, &server_id, &forwarded);
            return;
        }

        let Some(rewritten_id) = forwarded.get("id").and_then(Value::as_str).map(str::to_string)
        else {
            error!("rewritten id missing on tools/call from caller {}", caller_uuid);
            return;
        };

        self.registry.register_pending(
            &rewritten_id,
            id.clone(),
            caller_uuid,
            vec![server_id.clone()],
        );
        info!(
            "forwarding tools/call {} from caller {} to {}/{}",
            tool_name, caller_uuid, agent_id, server_id
        );
        if !self
            .registry
            .send_to_tool_server(agent_id, &server_id, &forwarded)
        {
            self.registry.remove_pending(&rewritten_id);
            self.reply_error(
                caller_uuid,
                id,
                types::FORWARD_FAILED,
                "failed to forward request to tool server",
            );
        }
    }

    /// Forward a request to every connected tool server of the agent and
    /// track the correlation.
    fn fan_out(&self, agent_id: &str, caller_uuid: &str, message: &Value, id: Value) {
        let servers = self.registry.agent_servers(agent_id);
        if servers.is_empty() {
            if id.is_null() {
                debug!(
                    "dropping notification from caller {}: no tool server connected",
                    caller_uuid
                );
            } else {
                self.reply_error(
                    caller_uuid,
                    id,
                    types::TOOL_NOT_CONNECTED,
                    "no tool server connected for agent",
                );
            }
            return;
        }

        let forwarded = rewrite::transform_message(message, caller_uuid);
        if id.is_null() {
            for server_id in &servers {
                self.registry
                    .send_to_tool_server(agent_id, server_id, &forwarded);
            }
            return;
        }

        let Some(rewritten_id) = forwarded.get("id").and_then(Value::as_str).map(str::to_string)
        else {
            error!("rewritten id missing on fan-out from caller {}", caller_uuid);
            return;
        };

        self.registry
            .register_pending(&rewritten_id, id.clone(), caller_uuid, servers.clone());

        let reached: Vec<String> = servers
            .iter()
            .filter(|server_id| {
                self.registry
                    .send_to_tool_server(agent_id, server_id, &forwarded)
            })
            .cloned()
            .collect();

        if reached.is_empty() {
            self.registry.remove_pending(&rewritten_id);
            self.reply_error(
                caller_uuid,
                id,
                types::FORWARD_FAILED,
                "failed to forward request to any tool server",
            );
        } else if reached.len() < servers.len() {
            debug!(
                "fan-out from caller {} reached {}/{} servers",
                caller_uuid,
                reached.len(),
                servers.len()
            );
            if let Some(pending) = self.registry.shrink_pending_expected(&rewritten_id, &reached) {
                self.deliver_aggregate(pending);
            }
        }
    }

    /// Handle one text frame from a tool-server socket.
    pub fn handle_tool_message(&self, agent_id: &str, server_id: &str, raw: &str) {
        let message: Value = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "dropping non-JSON frame from tool server {}/{}: {}",
                    agent_id, server_id, e
                );
                return;
            }
        };

        if let Some(result) = message.get("result") {
            if result.get("protocolVersion").is_some() {
                self.registry
                    .update_server_info(agent_id, server_id, result.clone());
                // continue the handshake only for the router's own initialize
                // request: acknowledge, then ask for the catalog
                if message.get("id") == Some(&json!(INITIALIZE_REQUEST_ID)) {
                    self.registry.send_to_tool_server(
                        agent_id,
                        server_id,
                        &types::notification_frame("notifications/initialized"),
                    );
                    self.registry.send_to_tool_server(
                        agent_id,
                        server_id,
                        &types::request_frame(
                            json!(TOOLS_LIST_REQUEST_ID),
                            "tools/list",
                            json!({}),
                        ),
                    );
                }
            }
            if let Some(tools) = result.get("tools").and_then(Value::as_array) {
                self.registry.update_tool_list(agent_id, server_id, tools);
            }
        }

        if let Some(rewritten_id) = message.get("id").and_then(Value::as_str) {
            match self
                .registry
                .record_response(rewritten_id, server_id, message.clone())
            {
                PendingOutcome::Completed(pending) => {
                    self.deliver_aggregate(pending);
                    return;
                }
                PendingOutcome::Recorded => return,
                PendingOutcome::NotTracked => {}
            }
        }

        // untracked: a late response or an unsolicited notification
        let (caller_uuid, restored) = rewrite::restore_message(&message);
        match caller_uuid {
            Some(caller_uuid) if self.registry.is_caller_uuid_connected(&caller_uuid) => {
                self.registry.send_to_caller(&caller_uuid, &restored);
            }
            Some(caller_uuid) => {
                debug!(
                    "caller {} gone, dropping message from tool server {}/{}",
                    caller_uuid, agent_id, server_id
                );
            }
            None => {
                debug!(
                    "dropping unroutable message from tool server {}/{}",
                    agent_id, server_id
                );
            }
        }
    }

    /// Aggregate a completed correlation and deliver it to its caller.
    fn deliver_aggregate(&self, pending: PendingResponse) {
        let aggregated = aggregate_responses(&pending);
        let (caller_uuid, restored) = rewrite::restore_message(&aggregated);
        // the aggregation-error frame carries the original id, which the
        // rewriter cannot route; fall back to the recorded caller
        let target = caller_uuid.unwrap_or_else(|| pending.caller_uuid.clone());
        if !self.registry.send_to_caller(&target, &restored) {
            debug!("caller {} gone, dropping aggregated response", target);
        }
    }

    fn reply_error(&self, caller_uuid: &str, id: Value, code: i32, message: &str) {
        let frame = types::error_frame(id, code, message);
        if !self.registry.send_to_caller(caller_uuid, &frame) {
            warn!("failed to deliver error response to caller {}", caller_uuid);
        }
    }

    /// Spawn the periodic maintenance task: expired correlations produce an
    /// `InternalError` for callers that are still connected, and idle
    /// connections are closed when an idle timeout is configured.
    pub fn spawn_maintenance(
        &self,
        pending_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                ticker.tick().await;

                for pending in registry.sweep_expired_pending(pending_timeout) {
                    if registry.is_caller_uuid_connected(&pending.caller_uuid) {
                        let frame = types::error_frame(
                            pending.original_id.clone(),
                            types::INTERNAL_ERROR,
                            "timed out waiting for tool server responses",
                        );
                        registry.send_to_caller(&pending.caller_uuid, &frame);
                    }
                }

                if let Some(idle_timeout) = idle_timeout {
                    registry.sweep_idle(idle_timeout);
                }
            }
        })
    }
}

//! In-flight fan-out correlations and response aggregation.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use super::ConnectionRegistry;
use crate::mcp::types;

/// Bookkeeping record for one in-flight fan-out correlation, keyed in the
/// registry by the rewritten request id.
#[derive(Debug, Clone)]
pub struct PendingResponse {
    /// The caller's id before rewriting, used for error frames.
    pub original_id: Value,
    pub caller_uuid: String,
    pub expected: HashSet<String>,
    pub received: HashMap<String, Value>,
    pub created_at: Instant,
}

impl PendingResponse {
    fn is_complete(&self) -> bool {
        self.expected
            .iter()
            .all(|server_id| self.received.contains_key(server_id))
    }
}

/// Outcome of recording one tool-server response against the pending table.
#[derive(Debug)]
pub enum PendingOutcome {
    /// All expected servers have responded; the entry has been removed.
    Completed(PendingResponse),
    /// Recorded (or ignored); more responses outstanding.
    Recorded,
    /// The id does not correspond to a tracked correlation.
    NotTracked,
}

impl ConnectionRegistry {
    /// Track a forwarded request. Must happen before the first forward so a
    /// fast response cannot arrive ahead of its entry.
    pub fn register_pending(
        &self,
        rewritten_id: &str,
        original_id: Value,
        caller_uuid: &str,
        expected: Vec<String>,
    ) {
        debug!(
            "registered pending response {} expecting {:?}",
            rewritten_id, expected
        );
        self.pending.insert(
            rewritten_id.to_string(),
            PendingResponse {
                original_id,
                caller_uuid: caller_uuid.to_string(),
                expected: expected.into_iter().collect(),
                received: HashMap::new(),
                created_at: Instant::now(),
            },
        );
    }

    /// Record one server's response. Responses from servers outside the
    /// expected set are ignored so `received ⊆ expected` always holds.
    pub fn record_response(
        &self,
        rewritten_id: &str,
        server_id: &str,
        response: Value,
    ) -> PendingOutcome {
        let complete = match self.pending.get_mut(rewritten_id) {
            Some(mut entry) => {
                if !entry.expected.contains(server_id) {
                    debug!(
                        "ignoring response from unexpected server {} for {}",
                        server_id, rewritten_id
                    );
                    return PendingOutcome::Recorded;
                }
                entry.received.insert(server_id.to_string(), response);
                debug!("recorded response from {} for {}", server_id, rewritten_id);
                entry.is_complete()
            }
            None => return PendingOutcome::NotTracked,
        };

        if complete {
            if let Some((_, pending)) = self.pending.remove(rewritten_id) {
                return PendingOutcome::Completed(pending);
            }
        }
        PendingOutcome::Recorded
    }

    /// Shrink a correlation's expected set to the servers a fan-out actually
    /// reached. Returns the entry when the shrink completes it.
    pub fn shrink_pending_expected(
        &self,
        rewritten_id: &str,
        reached: &[String],
    ) -> Option<PendingResponse> {
        let complete = match self.pending.get_mut(rewritten_id) {
            Some(mut entry) => {
                entry.expected.retain(|server_id| reached.contains(server_id));
                entry.is_complete()
            }
            None => false,
        };

        if complete {
            self.pending.remove(rewritten_id).map(|(_, pending)| pending)
        } else {
            None
        }
    }

    /// Drop a correlation without delivering anything. Idempotent.
    pub fn remove_pending(&self, rewritten_id: &str) {
        if self.pending.remove(rewritten_id).is_some() {
            debug!("removed pending response {}", rewritten_id);
        }
    }

    pub(crate) fn purge_pending_for_caller(&self, caller_uuid: &str) {
        self.pending
            .retain(|_, pending| pending.caller_uuid != caller_uuid);
    }

    /// Remove and return every correlation older than `timeout`.
    pub fn sweep_expired_pending(&self, timeout: Duration) -> Vec<PendingResponse> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| now.duration_since(entry.value().created_at) > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = Vec::with_capacity(expired.len());
        for rewritten_id in expired {
            if let Some((_, pending)) = self.pending.remove(&rewritten_id) {
                warn!(
                    "pending response {} timed out ({}/{} servers responded)",
                    rewritten_id,
                    pending.received.len(),
                    pending.expected.len()
                );
                swept.push(pending);
            }
        }
        swept
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Merge the responses of one completed correlation into a single reply
/// frame. The merged frame keeps the rewritten id so the return path can
/// demultiplex it; an aggregation failure produces an `InternalError` frame
/// carrying the original id instead.
pub fn aggregate_responses(pending: &PendingResponse) -> Value {
    match try_aggregate(pending) {
        Ok(frame) => frame,
        Err(details) => {
            error!("failed to aggregate tool server responses: {}", details);
            types::error_frame_with_data(
                pending.original_id.clone(),
                types::INTERNAL_ERROR,
                "failed to aggregate tool server responses",
                json!({ "details": details }),
            )
        }
    }
}

fn try_aggregate(pending: &PendingResponse) -> Result<Value, String> {
    let mut collected: Vec<Value> = Vec::new();
    let mut id = Value::String(String::new());
    let mut flag = "";

    for (server_id, response) in &pending.received {
        id = response
            .get("id")
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));

        if let Some(result) = response.get("result") {
            let result_fields = result
                .as_object()
                .ok_or_else(|| format!("result from server {} is not an object", server_id))?;

            if let Some(tools) = result_fields.get("tools") {
                flag = "tools";
                let tools = tools
                    .as_array()
                    .ok_or_else(|| format!("tools from server {} is not an array", server_id))?;
                for tool in tools {
                    let mut tool = tool.clone();
                    let descriptor = tool.as_object_mut().ok_or_else(|| {
                        format!("tool entry from server {} is not an object", server_id)
                    })?;
                    descriptor
                        .insert("server_id".to_string(), Value::String(server_id.clone()));
                    collected.push(tool);
                }
            } else if let Some(content) = result_fields.get("content") {
                flag = "content";
                let content = content
                    .as_array()
                    .ok_or_else(|| format!("content from server {} is not an array", server_id))?;
                collected.extend(content.iter().cloned());
            } else {
                let mut result = result.clone();
                if let Some(fields) = result.as_object_mut() {
                    fields.insert("server_id".to_string(), Value::String(server_id.clone()));
                }
                collected.push(result);
            }
        } else if let Some(error) = response.get("error") {
            let mut error = error.clone();
            let fields = error
                .as_object_mut()
                .ok_or_else(|| format!("error from server {} is not an object", server_id))?;
            fields.insert("server_id".to_string(), Value::String(server_id.clone()));
            collected.push(json!({ "error": error }));
        }
        // responses with neither result nor error contribute nothing
    }

    let shape = if flag.is_empty() { "responses" } else { flag };
    let mut body = serde_json::Map::new();
    body.insert(shape.to_string(), Value::Array(collected));
    body.insert("total_servers".to_string(), json!(pending.expected.len()));
    body.insert(
        "responded_servers".to_string(),
        json!(pending.received.len()),
    );

    Ok(json!({
        "jsonrpc": types::JSONRPC_VERSION,
        "id": id,
        "result": Value::Object(body),
    }))
}

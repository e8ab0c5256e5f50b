use serde_json::{json, Value};

/// MCP protocol revision spoken during the tool-server handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub const JSONRPC_VERSION: &str = "2.0";

// JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Implementation-defined server errors (-32000..-32099)
pub const TOOL_NOT_CONNECTED: i32 = -32001;
pub const FORWARD_FAILED: i32 = -32002;

pub fn request_frame(id: Value, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification_frame(method: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    })
}

pub fn error_frame(id: Value, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

pub fn error_frame_with_data(id: Value, code: i32, message: &str, data: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message,
            "data": data,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_carries_all_fields() {
        let frame = request_frame(json!(1), "initialize", json!({"a": 1}));
        assert_eq!(frame["jsonrpc"], "2.0");
        assert_eq!(frame["id"], 1);
        assert_eq!(frame["method"], "initialize");
        assert_eq!(frame["params"]["a"], 1);
    }

    #[test]
    fn notification_frame_has_no_id() {
        let frame = notification_frame("notifications/initialized");
        assert!(frame.get("id").is_none());
        assert_eq!(frame["method"], "notifications/initialized");
    }

    #[test]
    fn error_frame_preserves_id_type() {
        let frame = error_frame(json!("q"), METHOD_NOT_FOUND, "tool not found");
        assert_eq!(frame["id"], "q");
        assert_eq!(frame["error"]["code"], -32601);
        assert!(frame["error"].get("data").is_none());

        let frame = error_frame_with_data(json!(3), INTERNAL_ERROR, "boom", json!({"details": "x"}));
        assert_eq!(frame["error"]["data"]["details"], "x");
    }
}

//! JSON-RPC id rewriting.
//!
//! Every request forwarded to a tool server carries an id of the form
//! `<caller_uuid>_<t>_<payload>`, where `t` is `n` for numeric ids and `s`
//! for string ids. The return path splits on the first two `_` to recover
//! the caller connection and the original id. Hyphenated v4 UUIDs contain no
//! underscore, so the encoding is unambiguous.

use serde_json::Value;

/// Encode a caller connection UUID into a JSON-RPC id. `null` ids pass
/// through untouched (notifications carry no response).
pub fn rewrite_id(id: &Value, caller_uuid: &str) -> Value {
    match id {
        Value::Null => Value::Null,
        Value::Number(n) if n.is_i64() || n.is_u64() => {
            Value::String(format!("{}_n_{}", caller_uuid, n))
        }
        Value::String(s) => Value::String(format!("{}_s_{}", caller_uuid, s)),
        // exotic id types are stringified and tagged as strings
        other => Value::String(format!("{}_s_{}", caller_uuid, other)),
    }
}

/// Decode a rewritten id into `(caller_uuid, original_id)`. Returns `None`
/// when the value cannot be demultiplexed.
pub fn parse_rewritten_id(rewritten: &str) -> Option<(String, Value)> {
    let mut parts = rewritten.splitn(3, '_');
    let caller_uuid = parts.next()?;
    let tag = parts.next()?;
    let payload = parts.next()?;

    if caller_uuid.is_empty() {
        return None;
    }

    let original = match tag {
        "n" => payload
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| payload.parse::<u64>().map(Value::from))
            .unwrap_or_else(|_| Value::String(payload.to_string())),
        "s" => {
            if payload == "null" {
                Value::Null
            } else {
                Value::String(payload.to_string())
            }
        }
        _ => return None,
    };

    Some((caller_uuid.to_string(), original))
}

/// Clone a message with its id rewritten for the downstream path. Messages
/// without an id (or with a `null` id) are returned unchanged.
pub fn transform_message(message: &Value, caller_uuid: &str) -> Value {
    let mut out = message.clone();
    if let Some(obj) = out.as_object_mut() {
        let id = obj.get("id").cloned();
        if let Some(id) = id {
            if !id.is_null() {
                obj.insert("id".to_string(), rewrite_id(&id, caller_uuid));
            }
        }
    }
    out
}

/// Inverse of [`transform_message`]: restore the original id and report the
/// caller the message belongs to. Messages whose id does not decode are
/// returned unchanged with no caller.
pub fn restore_message(message: &Value) -> (Option<String>, Value) {
    let mut out = message.clone();
    if let Some(obj) = out.as_object_mut() {
        let rewritten = match obj.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };
        if let Some(rewritten) = rewritten {
            if let Some((caller_uuid, original)) = parse_rewritten_id(&rewritten) {
                obj.insert("id".to_string(), original);
                return (Some(caller_uuid), out);
            }
        }
    }
    (None, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const UUID: &str = "9b2c6f1e-8d4a-4e5b-9c3d-2f1a0b7c6d5e";

    #[test]
    fn numeric_ids_round_trip() {
        for id in [json!(0), json!(7), json!(-3), json!(i64::MAX), json!(u64::MAX)] {
            let rewritten = rewrite_id(&id, UUID);
            let encoded = rewritten.as_str().expect("rewritten id is a string");
            let (uuid, original) = parse_rewritten_id(encoded).expect("decodes");
            assert_eq!(uuid, UUID);
            assert_eq!(original, id, "round trip failed for {}", id);
        }
    }

    #[test]
    fn string_ids_round_trip() {
        for id in ["q", "", "req-42", "with_underscores_too", "null-ish"] {
            let rewritten = rewrite_id(&json!(id), UUID);
            let (uuid, original) = parse_rewritten_id(rewritten.as_str().expect("string"))
                .expect("decodes");
            assert_eq!(uuid, UUID);
            assert_eq!(original, json!(id));
        }
    }

    #[test]
    fn null_id_is_not_rewritten() {
        assert_eq!(rewrite_id(&Value::Null, UUID), Value::Null);
    }

    #[test]
    fn numeric_encoding_matches_wire_format() {
        assert_eq!(
            rewrite_id(&json!(7), UUID),
            json!(format!("{}_n_7", UUID))
        );
        assert_eq!(
            rewrite_id(&json!("q"), UUID),
            json!(format!("{}_s_q", UUID))
        );
    }

    #[test]
    fn string_null_payload_decodes_to_absent_id() {
        let (uuid, original) =
            parse_rewritten_id(&format!("{}_s_null", UUID)).expect("decodes");
        assert_eq!(uuid, UUID);
        assert_eq!(original, Value::Null);
    }

    #[test]
    fn non_decimal_numeric_payload_falls_back_to_string() {
        let (_, original) =
            parse_rewritten_id(&format!("{}_n_abc", UUID)).expect("decodes");
        assert_eq!(original, json!("abc"));
    }

    #[test]
    fn malformed_ids_do_not_decode() {
        assert!(parse_rewritten_id("").is_none());
        assert!(parse_rewritten_id("no-separators").is_none());
        assert!(parse_rewritten_id("uuid_n").is_none());
        assert!(parse_rewritten_id("uuid_x_payload").is_none());
        assert!(parse_rewritten_id("_n_7").is_none());
    }

    #[test]
    fn transform_rewrites_only_the_id() {
        let message = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": {"name": "calc"}
        });
        let transformed = transform_message(&message, UUID);
        assert_eq!(transformed["id"], format!("{}_n_7", UUID));
        assert_eq!(transformed["method"], message["method"]);
        assert_eq!(transformed["params"], message["params"]);
    }

    #[test]
    fn notifications_pass_through_unchanged() {
        let notification = json!({"jsonrpc": "2.0", "method": "ping"});
        assert_eq!(transform_message(&notification, UUID), notification);

        let null_id = json!({"jsonrpc": "2.0", "id": null, "method": "ping"});
        assert_eq!(transform_message(&null_id, UUID), null_id);

        let (caller, restored) = restore_message(&notification);
        assert!(caller.is_none());
        assert_eq!(restored, notification);
    }

    #[test]
    fn restore_recovers_caller_and_original_id() {
        let message = json!({
            "jsonrpc": "2.0",
            "id": 42,
            "method": "tools/call",
        });
        let transformed = transform_message(&message, UUID);
        let (caller, restored) = restore_message(&transformed);
        assert_eq!(caller.as_deref(), Some(UUID));
        assert_eq!(restored, message);
    }

    #[test]
    fn restore_leaves_foreign_ids_alone() {
        let message = json!({"jsonrpc": "2.0", "id": 5, "result": {}});
        let (caller, restored) = restore_message(&message);
        assert!(caller.is_none());
        assert_eq!(restored, message);
    }
}

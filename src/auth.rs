use serde::Deserialize;
use tracing::debug;

/// Payload carried by the `token` query parameter of both WebSocket paths.
/// The client URL-encodes a JSON object; axum's query extraction undoes the
/// percent-encoding, so the raw JSON arrives here.
#[derive(Debug, Deserialize)]
struct EndpointToken {
    #[serde(rename = "agentId")]
    agent_id: String,
}

/// Extract the agent id from an endpoint token. Returns `None` for anything
/// that is not a JSON object carrying a non-empty `agentId`.
pub fn agent_id_from_token(token: &str) -> Option<String> {
    let parsed: EndpointToken = match serde_json::from_str(token) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("rejecting malformed endpoint token: {}", e);
            return None;
        }
    };

    if parsed.agent_id.trim().is_empty() {
        return None;
    }
    Some(parsed.agent_id)
}

/// Validate the static key guarding the health endpoint. An empty configured
/// key matches nothing.
pub fn verify_health_key(provided: &str, expected: &str) -> bool {
    if provided.is_empty() || expected.is_empty() {
        return false;
    }
    constant_time_compare(provided, expected)
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.bytes().zip(b.bytes()) {
        result |= byte_a ^ byte_b;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_with_agent_id_parses() {
        assert_eq!(
            agent_id_from_token(r#"{"agentId": "agentA"}"#),
            Some("agentA".to_string())
        );
    }

    #[test]
    fn token_without_agent_id_is_rejected() {
        assert_eq!(agent_id_from_token(r#"{"foo": "bar"}"#), None);
        assert_eq!(agent_id_from_token(r#"{"agentId": ""}"#), None);
        assert_eq!(agent_id_from_token(r#"{"agentId": "   "}"#), None);
        assert_eq!(agent_id_from_token("not-json"), None);
        assert_eq!(agent_id_from_token(""), None);
    }

    #[test]
    fn extra_token_fields_are_ignored() {
        assert_eq!(
            agent_id_from_token(r#"{"agentId": "a1", "issued": 123}"#),
            Some("a1".to_string())
        );
    }

    #[test]
    fn health_key_matches_exactly() {
        assert!(verify_health_key("secret", "secret"));
        assert!(!verify_health_key("secret", "other"));
        assert!(!verify_health_key("sec", "secret"));
    }

    #[test]
    fn empty_keys_never_match() {
        assert!(!verify_health_key("", ""));
        assert!(!verify_health_key("", "secret"));
        assert!(!verify_health_key("secret", ""));
    }
}

//! JSON framing spoken to workload containers.
//!
//! The node POSTs `{"requestId": ..., "request": "0x<hex>"}` to the container
//! root and reads a JSON reply with at least `{"result": "0x<hex>"}`. A reply
//! carrying a `steps` field is promoted to a receipt: the whole envelope, with
//! the request hex merged in, goes to the archive. Anything that does not
//! parse as a conforming envelope is passed through as raw bytes.

use serde::Serialize;

/// Request envelope sent to the container root.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRequest {
    pub request_id: String,
    /// 0x-prefixed hex of the raw request payload.
    pub request: String,
}

impl WorkloadRequest {
    pub fn new(request_id: &str, payload: &[u8]) -> Self {
        Self {
            request_id: request_id.to_string(),
            request: format!("0x{}", hex::encode(payload)),
        }
    }
}

/// Parsed workload reply.
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// Raw result bytes, decoded from the reply's `result` hex field, or the
    /// verbatim body for non-conforming replies.
    pub result: Vec<u8>,
    /// Full reply envelope when the workload reported execution steps.
    pub receipt: Option<serde_json::Value>,
}

/// Parses a container reply body.
///
/// `request_hex` is merged into the receipt so the archive records what the
/// workload was asked, not just what it answered.
pub fn parse_reply(request_hex: &str, body: &[u8]) -> AgentReply {
    let envelope: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => {
            return AgentReply {
                result: body.to_vec(),
                receipt: None,
            };
        }
    };
    let result = envelope
        .get("result")
        .and_then(|r| r.as_str())
        .and_then(decode_hex);
    let Some(result) = result else {
        return AgentReply {
            result: body.to_vec(),
            receipt: None,
        };
    };

    let receipt = if envelope.get("steps").is_some() {
        let mut merged = envelope;
        merged["request"] = serde_json::Value::String(request_hex.to_string());
        Some(merged)
    } else {
        None
    };

    AgentReply { result, receipt }
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(stripped).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_with_hex_payload() {
        let request = WorkloadRequest::new("blockchain-42", &[0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "requestId": "blockchain-42",
                "request": "0xdeadbeef"
            })
        );
    }

    #[test]
    fn echo_reply_round_trips_bytes() {
        let payload = [0xde, 0xad, 0xbe, 0xef];
        let request = WorkloadRequest::new("blockchain-42", &payload);
        let body = serde_json::json!({ "result": request.request }).to_string();
        let reply = parse_reply(&request.request, body.as_bytes());
        assert_eq!(reply.result, payload);
        assert!(reply.receipt.is_none());
    }

    #[test]
    fn steps_promote_the_envelope_to_a_receipt() {
        let body = serde_json::json!({
            "result": "0x01",
            "steps": [{"tool": "search", "output": "ok"}]
        })
        .to_string();
        let reply = parse_reply("0xdeadbeef", body.as_bytes());
        assert_eq!(reply.result, vec![0x01]);
        let receipt = reply.receipt.unwrap();
        assert_eq!(receipt["request"], "0xdeadbeef");
        assert_eq!(receipt["steps"][0]["tool"], "search");
    }

    #[test]
    fn non_json_reply_is_raw_passthrough() {
        let body = b"internal error";
        let reply = parse_reply("0x00", body);
        assert_eq!(reply.result, body.to_vec());
        assert!(reply.receipt.is_none());
    }

    #[test]
    fn json_without_result_is_raw_passthrough() {
        let body = serde_json::json!({ "error": "no result here" }).to_string();
        let reply = parse_reply("0x00", body.as_bytes());
        assert_eq!(reply.result, body.as_bytes().to_vec());
        assert!(reply.receipt.is_none());
    }

    #[test]
    fn unprefixed_result_hex_is_accepted() {
        let body = serde_json::json!({ "result": "cafe" }).to_string();
        let reply = parse_reply("0x00", body.as_bytes());
        assert_eq!(reply.result, vec![0xca, 0xfe]);
    }
}

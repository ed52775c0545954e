//! JSON codec for outbound requests and inbound frames.

use crate::{Result, WsClientError};
use serde_json::{Map, Value};

/// Field carrying the command name in an outbound request.
pub const COMMAND_FIELD: &str = "command";

/// Decode one inbound payload.
pub fn decode_frame(payload: &[u8]) -> std::result::Result<Value, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Build the request object for `command`.
///
/// `params` is either `null` (no parameters) or an object whose fields are
/// copied into the request. The command field always wins over a caller field
/// of the same name.
pub fn build_request(command: &str, params: &Value) -> Result<Value> {
    let mut request = match params {
        Value::Null => Map::new(),
        Value::Object(fields) => fields.clone(),
        other => {
            return Err(WsClientError::InvalidParams {
                message: format!("params must be an object or null, got {}", type_name(other)),
            })
        }
    };
    request.insert(COMMAND_FIELD.to_string(), Value::String(command.to_string()));
    Ok(Value::Object(request))
}

/// Encode a value as the text of one outbound frame.
pub fn encode(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_request_merges_params() {
        let request = build_request("ledger", &json!({"ledger_index": "validated"})).unwrap();
        assert_eq!(
            request,
            json!({"ledger_index": "validated", "command": "ledger"})
        );
    }

    #[test]
    fn test_build_request_without_params() {
        let request = build_request("ping", &Value::Null).unwrap();
        assert_eq!(request, json!({"command": "ping"}));
    }

    #[test]
    fn test_build_request_command_overrides_caller_field() {
        let request = build_request("ping", &json!({"command": "stop"})).unwrap();
        assert_eq!(request["command"], "ping");
    }

    #[test]
    fn test_build_request_rejects_non_object_params() {
        let result = build_request("ping", &json!([1, 2]));
        match result {
            Err(WsClientError::InvalidParams { message }) => assert!(message.contains("array")),
            other => panic!("Expected InvalidParams, got: {:?}", other),
        }
    }

    #[test]
    fn test_decode_frame() {
        assert_eq!(
            decode_frame(br#"{"type":"ledgerClosed"}"#).unwrap(),
            json!({"type": "ledgerClosed"})
        );
        assert!(decode_frame(b"{not json").is_err());
        assert!(decode_frame(b"").is_err());
    }
}

//! Recognizing and normalizing replies.

use serde_json::{Map, Value};

pub const TYPE_FIELD: &str = "type";
pub const RESPONSE_TYPE: &str = "response";
pub const STATUS_FIELD: &str = "status";
pub const RESULT_FIELD: &str = "result";
pub const ERROR_FIELD: &str = "error";
pub const ERROR_STATUS: &str = "error";

/// Whether `message` is a reply to a request rather than a server push.
pub fn is_response(message: &Value) -> bool {
    message.get(TYPE_FIELD).and_then(Value::as_str) == Some(RESPONSE_TYPE)
}

/// Reshape a reply into the form callers inspect.
///
/// The `type` discriminator is removed. An error reply is wrapped as
/// `{ result: <reply>, error: <reply.error>, status: "error" }`. Otherwise a
/// top-level `status` is copied into `result` when both are present.
pub fn normalize_response(mut reply: Value) -> Value {
    let Some(fields) = reply.as_object_mut() else {
        return reply;
    };
    fields.remove(TYPE_FIELD);

    if fields.get(STATUS_FIELD).and_then(Value::as_str) == Some(ERROR_STATUS) {
        let mut wrapped = Map::new();
        if let Some(error) = fields.get(ERROR_FIELD) {
            wrapped.insert(ERROR_FIELD.to_string(), error.clone());
        }
        wrapped.insert(STATUS_FIELD.to_string(), Value::String(ERROR_STATUS.to_string()));
        wrapped.insert(RESULT_FIELD.to_string(), reply);
        return Value::Object(wrapped);
    }

    if let Some(status) = fields.get(STATUS_FIELD).cloned() {
        match fields.get_mut(RESULT_FIELD) {
            Some(Value::Object(result)) => {
                result.insert(STATUS_FIELD.to_string(), status);
            }
            Some(result) if result.is_null() => {
                let mut with_status = Map::new();
                with_status.insert(STATUS_FIELD.to_string(), status);
                *result = Value::Object(with_status);
            }
            _ => {}
        }
    }

    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_response() {
        assert!(is_response(&json!({"type": "response"})));
        assert!(!is_response(&json!({"type": "ledgerClosed"})));
        assert!(!is_response(&json!({"status": "success"})));
        assert!(!is_response(&Value::Null));
    }

    #[test]
    fn test_success_reply_loses_type() {
        let reply = normalize_response(json!({"type": "response", "status": "success"}));
        assert_eq!(reply, json!({"status": "success"}));
    }

    #[test]
    fn test_status_copied_into_result() {
        let reply = normalize_response(json!({
            "type": "response",
            "status": "success",
            "result": {"ledger_index": 3}
        }));
        assert_eq!(
            reply,
            json!({"status": "success", "result": {"ledger_index": 3, "status": "success"}})
        );
    }

    #[test]
    fn test_error_reply_is_wrapped() {
        let reply = normalize_response(json!({
            "type": "response",
            "status": "error",
            "error": "noSuchCommand"
        }));
        assert_eq!(
            reply,
            json!({
                "result": {"status": "error", "error": "noSuchCommand"},
                "error": "noSuchCommand",
                "status": "error"
            })
        );
    }

    #[test]
    fn test_error_reply_without_error_field() {
        let reply = normalize_response(json!({"type": "response", "status": "error"}));
        assert_eq!(
            reply,
            json!({"result": {"status": "error"}, "status": "error"})
        );
    }

    #[test]
    fn test_null_result_gets_status() {
        let reply = normalize_response(json!({"status": "success", "result": null}));
        assert_eq!(reply["result"], json!({"status": "success"}));
    }

    #[test]
    fn test_scalar_result_left_alone() {
        let reply = normalize_response(json!({"status": "success", "result": 5}));
        assert_eq!(reply["result"], json!(5));
    }

    #[test]
    fn test_non_object_passes_through() {
        assert_eq!(normalize_response(json!([1, 2])), json!([1, 2]));
    }
}

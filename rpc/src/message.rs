//! JSON-RPC 2.0 message shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Request cancelled by the server (LSP convention, shared by MTP hosts).
pub const REQUEST_CANCELLED: i64 = -32800;

#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {detail}"))
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, detail.to_string())
    }
}

#[must_use]
pub fn success_response(id: &Value, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

#[must_use]
pub fn error_response(id: &Value, error: &ErrorObject) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
}

/// Split a response body into its result or error.
pub fn into_result(mut body: Value) -> Result<Value, ErrorObject> {
    if let Some(error) = body.get_mut("error").map(Value::take) {
        return Err(serde_json::from_value(error).unwrap_or_else(|_| {
            ErrorObject::new(INTERNAL_ERROR, "malformed error object in response")
        }));
    }
    Ok(body.get_mut("result").map(Value::take).unwrap_or(Value::Null))
}

/// Classification of a frame received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingFrame {
    /// Reply to one of our requests.
    Response { id: u64, body: Value },
    /// Request from the peer that expects a reply.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl IncomingFrame {
    /// Classify a raw frame. Returns `None` for frames that are none of the three.
    pub fn parse(mut frame: Value) -> Option<Self> {
        let method = frame.get("method").and_then(Value::as_str).map(String::from);
        let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();
        let id = frame.get("id").filter(|id| !id.is_null()).cloned();
        let params = frame.get_mut("params").map(Value::take);

        match (id, method, has_result_or_error) {
            (Some(id), None, true) => Some(Self::Response {
                id: id.as_u64()?,
                body: frame,
            }),
            (Some(id), Some(method), _) => Some(Self::Request { id, method, params }),
            (None, Some(method), _) => Some(Self::Notification { method, params }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn classifies_frames() {
        let response = IncomingFrame::parse(json!({"jsonrpc":"2.0","id":4,"result":{"ok":true}}));
        assert!(matches!(response, Some(IncomingFrame::Response { id: 4, .. })));

        let request = IncomingFrame::parse(
            json!({"jsonrpc":"2.0","id":"a","method":"client/attachDebugger","params":{"processId":7}}),
        );
        let Some(IncomingFrame::Request { id, method, params }) = request else {
            panic!("expected request");
        };
        assert_eq!(id, json!("a"));
        assert_eq!(method, "client/attachDebugger");
        assert_eq!(params, Some(json!({"processId": 7})));

        let notification =
            IncomingFrame::parse(json!({"jsonrpc":"2.0","method":"client/log","params":{}}));
        assert!(matches!(notification, Some(IncomingFrame::Notification { .. })));

        assert!(IncomingFrame::parse(json!({"jsonrpc":"2.0"})).is_none());
        // Non-numeric ids never match one of our requests.
        assert!(IncomingFrame::parse(json!({"jsonrpc":"2.0","id":"x","result":1})).is_none());
    }

    #[test]
    fn into_result_splits_error() {
        let ok = into_result(json!({"jsonrpc":"2.0","id":1,"result":[1,2]})).unwrap();
        assert_eq!(ok, json!([1, 2]));

        let err = into_result(
            json!({"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}),
        )
        .unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert_eq!(err.message, "nope");

        assert_eq!(into_result(json!({"id":1,"result":null})).unwrap(), Value::Null);
    }
}

//! Typed DAP frames.
//!
//! Every frame is one of [`Request`], [`Response`] or [`Event`], discriminated
//! by `type`. Properties the model does not name are kept in
//! `additional_properties` and written back unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed DAP message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolMessage {
    Request(Request),
    Response(Response),
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: i64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(flatten)]
    pub additional_properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: i64,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(flatten)]
    pub additional_properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(flatten)]
    pub additional_properties: Map<String, Value>,
}

impl Request {
    pub fn new(seq: i64, command: impl Into<String>, arguments: Option<Value>) -> Self {
        Self {
            seq,
            command: command.into(),
            arguments,
            additional_properties: Map::new(),
        }
    }
}

impl ProtocolMessage {
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(self)?)
    }

    #[must_use]
    pub fn seq(&self) -> i64 {
        match self {
            Self::Request(r) => r.seq,
            Self::Response(r) => r.seq,
            Self::Event(e) => e.seq,
        }
    }

    pub fn set_seq(&mut self, seq: i64) {
        match self {
            Self::Request(r) => r.seq = seq,
            Self::Response(r) => r.seq = seq,
            Self::Event(e) => e.seq = seq,
        }
    }

    /// Command for requests and responses, event name for events.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Request(r) => &r.command,
            Self::Response(r) => &r.command,
            Self::Event(e) => &e.event,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn discriminates_on_type() {
        let request = ProtocolMessage::from_value(json!({
            "seq": 3, "type": "request", "command": "attach",
            "arguments": {"processId": 1234}
        }))
        .unwrap();
        let ProtocolMessage::Request(request) = request else {
            panic!("expected request");
        };
        assert_eq!(request.command, "attach");
        assert_eq!(request.arguments, Some(json!({"processId": 1234})));

        let response = ProtocolMessage::from_value(json!({
            "seq": 4, "type": "response", "request_seq": 3,
            "success": false, "command": "attach", "message": "no such process"
        }))
        .unwrap();
        assert!(matches!(
            response,
            ProtocolMessage::Response(Response { request_seq: 3, success: false, .. })
        ));

        let event = ProtocolMessage::from_value(json!({
            "seq": 5, "type": "event", "event": "stopped", "body": {"threadId": 1}
        }))
        .unwrap();
        assert_eq!(event.name(), "stopped");
    }

    #[test]
    fn unknown_properties_survive_reserialization() {
        let raw = json!({
            "seq": 9, "type": "event", "event": "output",
            "body": {"category": "stdout", "output": "hi\n"},
            "__vendorTrace": {"id": "abc"},
            "timestamp": 17
        });
        let message = ProtocolMessage::from_value(raw.clone()).unwrap();
        let ProtocolMessage::Event(event) = &message else {
            panic!("expected event");
        };
        assert_eq!(event.additional_properties["timestamp"], 17);
        assert_eq!(message.to_value().unwrap(), raw);
    }

    #[test]
    fn malformed_frames_are_errors() {
        for raw in [
            json!({"seq": 1, "type": "reverse", "command": "x"}),
            json!({"seq": 1, "command": "x"}),
            json!({"seq": "one", "type": "request", "command": "x"}),
            json!({"seq": 1, "type": "response", "command": "x"}),
            json!([1, 2]),
        ] {
            assert!(ProtocolMessage::from_value(raw.clone()).is_err(), "{raw}");
        }
    }
}

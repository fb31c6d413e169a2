use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::IngressError;

/// Identifier of one running workflow. Owned by the workflow engine; the
/// router only records associations to it.
pub type WorkflowInstanceId = Uuid;

/// Opaque handle for an external endpoint: a socket session, a chat channel,
/// a webhook caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Transports send the id either as a JSON string or a JSON number.
    pub fn from_json(value: &Value) -> Result<Self, IngressError> {
        match value {
            Value::String(s) => Ok(Self(s.clone())),
            Value::Number(n) => Ok(Self(n.to_string())),
            _ => Err(IngressError::InvalidSourceId),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Canonical record for one received message. Consumed exactly once, either
/// by the dispatch loop or by the workflow it was routed to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InboundEvent {
    pub source_id: Option<SourceId>,
    pub workflow_instance_id: Option<WorkflowInstanceId>,
    pub data: Value,
}

impl InboundEvent {
    pub fn new(
        source_id: Option<SourceId>,
        workflow_instance_id: Option<WorkflowInstanceId>,
        data: Value,
    ) -> Self {
        Self {
            source_id,
            workflow_instance_id,
            data,
        }
    }

    /// The `message` field of the payload, when it is a string.
    pub fn message(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }
}

/// Frame pushed to websocket clients. Clients filter on `source_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source_id: SourceId,
    pub message: String,
}

impl Envelope {
    pub fn new(source_id: SourceId, message: impl Into<String>) -> Self {
        Self {
            source_id,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Two string fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Result of popping the start queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StartEvent {
    pub event: InboundEvent,
    /// `false` when the event belongs to a snapshotted instance that should
    /// be resumed instead of created.
    pub new_workflow_needed: bool,
}

/// Raw bytes to text. Binary websocket frames go through here.
pub fn decode_utf8(bytes: &[u8]) -> Result<&str, IngressError> {
    Ok(std::str::from_utf8(bytes)?)
}

/// Parse `text` and insist on a JSON object at the top level.
pub fn parse_object(text: &str) -> Result<Map<String, Value>, IngressError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(IngressError::NotAnObject),
    }
}

/// Extract the mandatory `source_id` of a payload.
pub fn require_source_id(map: &Map<String, Value>) -> Result<SourceId, IngressError> {
    let value = map
        .get("source_id")
        .ok_or(IngressError::MissingField("source_id"))?;
    SourceId::from_json(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_id_accepts_strings_and_numbers() {
        assert_eq!(SourceId::from_json(&json!("c1")).unwrap(), SourceId::from("c1"));
        assert_eq!(SourceId::from_json(&json!(42)).unwrap(), SourceId::from("42"));
        assert!(matches!(
            SourceId::from_json(&json!({"nested": true})),
            Err(IngressError::InvalidSourceId)
        ));
        assert!(matches!(
            SourceId::from_json(&Value::Null),
            Err(IngressError::InvalidSourceId)
        ));
    }

    #[test]
    fn parse_object_rejects_non_objects() {
        assert!(matches!(parse_object("not json"), Err(IngressError::InvalidJson(_))));
        assert!(matches!(parse_object("[1,2]"), Err(IngressError::NotAnObject)));
        assert!(matches!(parse_object("\"text\""), Err(IngressError::NotAnObject)));
        assert!(parse_object(r#"{"source_id":"a"}"#).is_ok());
    }

    #[test]
    fn require_source_id_reports_missing_field() {
        let map = parse_object(r#"{"message":"hi"}"#).unwrap();
        assert!(matches!(
            require_source_id(&map),
            Err(IngressError::MissingField("source_id"))
        ));
    }

    #[test]
    fn decode_utf8_rejects_invalid_bytes() {
        assert_eq!(decode_utf8(b"{}").unwrap(), "{}");
        assert!(matches!(
            decode_utf8(&[0xff, 0xfe, 0xfd]),
            Err(IngressError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn envelope_serializes_flat() {
        let envelope = Envelope::new(SourceId::from("c1"), "hello");
        let value: Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(value, json!({"source_id": "c1", "message": "hello"}));
    }

    #[test]
    fn event_message_reads_string_payloads_only() {
        let event = InboundEvent::new(None, None, json!({"message": "end"}));
        assert_eq!(event.message(), Some("end"));

        let event = InboundEvent::new(None, None, json!({"message": 3}));
        assert_eq!(event.message(), None);
    }
}

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Message type tags with protocol meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Heartbeat request sent by the client.
    Ping,
    /// Legacy heartbeat acknowledgement, ignored.
    Pong,
    /// Legacy call acknowledgement, ignored.
    Ok,
    /// Reply correlated to an outbound call by `call_id`.
    Reply,
    /// Anything else, delivered to the caller unmodified.
    Event,
}

impl MessageType {
    pub const PING: &'static str = "ping";
    pub const PONG: &'static str = "pong";
    pub const OK: &'static str = "ok";
    pub const REPLY: &'static str = "reply";

    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag {
            Some(Self::PING) => Self::Ping,
            Some(Self::PONG) => Self::Pong,
            Some(Self::OK) => Self::Ok,
            Some(Self::REPLY) => Self::Reply,
            _ => Self::Event,
        }
    }
}

/// JSON message exchanged with the RTM server.
///
/// `type` and `call_id` are the only fields the client interprets; everything
/// else is carried through `fields`. A `type` that is not a string or a
/// `call_id` that is not an unsigned integer stays in `fields` as received,
/// so serializing an inbound message reproduces the frame.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct Message {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u64>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Message {
    /// Creates a message with the given `type` tag.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    /// Heartbeat request.
    pub fn ping() -> Self {
        Self::new(MessageType::PING)
    }

    pub fn with_call_id(mut self, call_id: u64) -> Self {
        self.call_id = Some(call_id);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from_tag(self.kind.as_deref())
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Reply status, e.g. `"ok"`.
    pub fn status(&self) -> Option<&str> {
        self.field("status").and_then(Value::as_str)
    }

    /// Reply result code.
    pub fn code(&self) -> Option<i64> {
        self.field("code").and_then(Value::as_i64)
    }

    /// Server timestamp in milliseconds.
    pub fn ts(&self) -> Option<i64> {
        self.field("ts").and_then(Value::as_i64)
    }

    /// Builds a message from a decoded JSON object.
    pub fn from_object(object: Map<String, Value>) -> Self {
        let mut fields: BTreeMap<String, Value> = object.into_iter().collect();
        let kind = take_typed(&mut fields, "type", |value| value.as_str().map(str::to_owned));
        let call_id = take_typed(&mut fields, "call_id", Value::as_u64);
        Self {
            kind,
            call_id,
            fields,
        }
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::Object(object) => Ok(Self::from_object(object)),
            other => Err(serde_json::Error::custom(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Object(object) => Ok(Self::from_object(object)),
            other => Err(D::Error::custom(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}

/// Moves `key` out of `fields` only when `convert` accepts its value.
fn take_typed<T>(
    fields: &mut BTreeMap<String, Value>,
    key: &str,
    convert: impl FnOnce(&Value) -> Option<T>,
) -> Option<T> {
    let typed = fields.get(key).and_then(convert)?;
    fields.remove(key);
    Some(typed)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reply_exposes_status_code_and_ts() {
        let reply = Message::from_text(
            r#"{"code":0,"status":"ok","ts":1700000000000,"type":"reply","call_id":65533}"#,
        )
        .expect("decode reply");

        assert_eq!(reply.message_type(), MessageType::Reply);
        assert_eq!(reply.call_id, Some(65533));
        assert_eq!(reply.status(), Some("ok"));
        assert_eq!(reply.code(), Some(0));
        assert_eq!(reply.ts(), Some(1_700_000_000_000));
    }

    #[test]
    fn untyped_message_serializes_only_call_id() {
        let message = Message::default().with_call_id(0);
        assert_eq!(message.to_text().expect("encode"), r#"{"call_id":0}"#);
    }

    #[test]
    fn payload_is_flattened_next_to_type_and_call_id() {
        let message = Message::new("message")
            .with_call_id(4)
            .with_field("text", "hi")
            .with_field("vchannel_id", "=bw52O");

        let value: serde_json::Value =
            serde_json::from_str(&message.to_text().expect("encode")).expect("json");
        assert_eq!(
            value,
            json!({"type": "message", "call_id": 4, "text": "hi", "vchannel_id": "=bw52O"})
        );
    }

    #[test]
    fn message_type_dispatch() {
        assert_eq!(Message::ping().message_type(), MessageType::Ping);
        assert_eq!(Message::new("pong").message_type(), MessageType::Pong);
        assert_eq!(Message::new("ok").message_type(), MessageType::Ok);
        assert_eq!(
            Message::new("update_user_connection").message_type(),
            MessageType::Event
        );
        assert_eq!(Message::default().message_type(), MessageType::Event);
    }

    #[test]
    fn inbound_event_keeps_unknown_fields() {
        let text = r#"{"data":{"connection":"connected","uid":"=bw52O"},"":1,"type":"update_user_connection"}"#;
        let event = Message::from_text(text).expect("decode event");

        assert_eq!(event.kind.as_deref(), Some("update_user_connection"));
        assert_eq!(event.call_id, None);
        assert_eq!(
            event.field("data"),
            Some(&json!({"connection": "connected", "uid": "=bw52O"}))
        );
        assert_eq!(event.field(""), Some(&json!(1)));
    }

    #[test]
    fn loosely_typed_type_and_call_id_stay_in_fields() {
        for frame in [
            json!({"type": "message", "call_id": "abc", "text": "hi"}),
            json!({"type": "message", "call_id": -1}),
            json!({"type": 7, "text": "hi"}),
            json!({"type": null, "call_id": 1.5}),
        ] {
            let message = Message::from_text(&frame.to_string()).expect("decode frame");
            assert_eq!(message.message_type(), MessageType::Event);
            assert_eq!(serde_json::to_value(&message).expect("encode"), frame);
        }

        let message = Message::from_text(r#"{"type":7,"call_id":3}"#).expect("decode");
        assert_eq!(message.kind, None);
        assert_eq!(message.call_id, Some(3));
        assert_eq!(message.field("type"), Some(&json!(7)));
    }

    #[test]
    fn non_object_frame_is_rejected() {
        assert!(Message::from_text("[1, 2]").is_err());
        assert!(Message::from_text("\"ping\"").is_err());
        assert!(Message::from_value(json!(5)).is_err());
    }
}

//! Wire protocol types for host-worker communication.
//!
//! One JSON object per line in each direction:
//! - host → worker: [`Command`]
//! - worker → host: [`Response`] (has `id`) or [`Notification`] (has `notification`)
//!
//! Inbound objects are classified by shape, not by a tag, so parsing goes
//! through [`InboundMessage::from_value`] instead of a derived `Deserialize`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reported when a failed response carries no usable `error` field.
pub const UNKNOWN_ERROR: &str = "unknown error";

/// Opaque identifier correlating a command with its response.
///
/// Minted as a UUID v4 string; the worker echoes it back untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CommandId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CommandId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Command sent from host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    #[serde(rename = "type")]
    pub command_type: String,
    pub params: Value,
}

/// Worker reply to a single command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: CommandId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(id: impl Into<CommandId>, data: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: impl Into<CommandId>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Success payload or the worker's error message.
    pub fn into_result(self) -> Result<Value, String> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| UNKNOWN_ERROR.to_string()))
        }
    }

    /// Build from a JSON object already known to carry an `id`.
    ///
    /// Accepts both the nested `data` form and the flattened form where the
    /// worker merges its result fields into the envelope.
    fn from_object(mut obj: Map<String, Value>) -> Result<Self, ProtocolError> {
        let id = match obj.remove("id") {
            Some(Value::String(id)) => CommandId(id),
            Some(Value::Number(n)) => CommandId(n.to_string()),
            other => return Err(ProtocolError::InvalidId(other.unwrap_or(Value::Null))),
        };

        let success = obj
            .remove("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let error = obj.remove("error");

        if success {
            let data = match obj.remove("data") {
                Some(data) => data,
                None if obj.is_empty() => Value::Null,
                None => Value::Object(obj),
            };
            Ok(Self::success(id, data))
        } else {
            let message = match error {
                Some(Value::String(message)) => message,
                None | Some(Value::Null) => UNKNOWN_ERROR.to_string(),
                Some(other) => other.to_string(),
            };
            Ok(Self::failure(id, message))
        }
    }
}

/// Unsolicited push from the worker, routed by topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub topic: String,
    #[serde(default)]
    pub data: Value,
}

impl Notification {
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            data,
        }
    }
}

/// Outer `{"notification": {...}}` wrapper as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub notification: Notification,
}

/// A classified worker → host message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response(Response),
    Notification(Notification),
}

impl InboundMessage {
    /// Classify a parsed JSON value by shape.
    ///
    /// `notification` wins over `id` when both are present.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        if let Some(inner) = obj.remove("notification") {
            let notification = serde_json::from_value::<Notification>(inner)
                .map_err(ProtocolError::InvalidNotification)?;
            return Ok(Self::Notification(notification));
        }

        if obj.contains_key("id") {
            return Response::from_object(obj).map(Self::Response);
        }

        Err(ProtocolError::UnknownShape)
    }
}

/// Reasons an inbound line is discarded.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("object has neither `notification` nor `id`")]
    UnknownShape,

    #[error("invalid notification: {0}")]
    InvalidNotification(#[source] serde_json::Error),

    #[error("invalid response id: {0}")]
    InvalidId(Value),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(line: &str) -> Result<InboundMessage, ProtocolError> {
        InboundMessage::from_value(serde_json::from_str(line).unwrap())
    }

    #[test]
    fn command_serializes() {
        let command = Command {
            id: CommandId::from("cmd-1"),
            command_type: "get_user_info".to_string(),
            params: json!({"username": "alice"}),
        };
        insta::assert_json_snapshot!(command, @r#"
        {
          "id": "cmd-1",
          "type": "get_user_info",
          "params": {
            "username": "alice"
          }
        }
        "#);
    }

    #[test]
    fn failed_response_serializes_without_data() {
        let resp = Response::failure("cmd-2", "Stream handler not initialized");
        insta::assert_json_snapshot!(resp, @r#"
        {
          "id": "cmd-2",
          "success": false,
          "error": "Stream handler not initialized"
        }
        "#);
    }

    #[test]
    fn notification_envelope_serializes() {
        let envelope = NotificationEnvelope {
            notification: Notification::new("streamer_live", json!({"username": "alice"})),
        };
        insta::assert_json_snapshot!(envelope, @r#"
        {
          "notification": {
            "type": "streamer_live",
            "data": {
              "username": "alice"
            }
          }
        }
        "#);
    }

    #[test]
    fn command_ids_are_unique() {
        let a = CommandId::new();
        let b = CommandId::new();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn nested_data_response() {
        let msg = classify(r#"{"id":"x","success":true,"data":{"login":"alice"}}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Response(Response::success("x", json!({"login": "alice"})))
        );
    }

    #[test]
    fn flattened_response_collects_remaining_fields() {
        let msg = classify(
            r#"{"id":"x","success":true,"stream_id":"s-1","error":null}"#,
        )
        .unwrap();
        let InboundMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.into_result().unwrap(), json!({"stream_id": "s-1"}));
    }

    #[test]
    fn bare_success_has_null_data() {
        let InboundMessage::Response(resp) = classify(r#"{"id":"x","success":true}"#).unwrap()
        else {
            panic!("expected response");
        };
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn failure_keeps_worker_message() {
        let InboundMessage::Response(resp) =
            classify(r#"{"id":"x","success":false,"error":"Missing command type"}"#).unwrap()
        else {
            panic!("expected response");
        };
        assert_eq!(resp.into_result().unwrap_err(), "Missing command type");
    }

    #[test]
    fn failure_without_error_is_unknown() {
        for line in [
            r#"{"id":"x","success":false}"#,
            r#"{"id":"x","success":false,"error":null}"#,
            r#"{"id":"x"}"#,
        ] {
            let InboundMessage::Response(resp) = classify(line).unwrap() else {
                panic!("expected response");
            };
            assert_eq!(resp.into_result().unwrap_err(), UNKNOWN_ERROR);
        }
    }

    #[test]
    fn non_string_error_is_rendered_as_json() {
        let InboundMessage::Response(resp) =
            classify(r#"{"id":"x","success":false,"error":{"code":7}}"#).unwrap()
        else {
            panic!("expected response");
        };
        assert_eq!(resp.into_result().unwrap_err(), r#"{"code":7}"#);
    }

    #[test]
    fn numeric_id_becomes_string() {
        let InboundMessage::Response(resp) =
            classify(r#"{"id":42,"success":true,"data":1}"#).unwrap()
        else {
            panic!("expected response");
        };
        assert_eq!(resp.id.as_str(), "42");
    }

    #[test]
    fn notification_is_classified() {
        let msg = classify(r#"{"notification":{"type":"streamer_live","data":{"n":1}}}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Notification(Notification::new("streamer_live", json!({"n": 1})))
        );
    }

    #[test]
    fn notification_wins_over_id() {
        let msg = classify(r#"{"id":"x","notification":{"type":"t"}}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Notification(Notification::new("t", Value::Null))
        );
    }

    #[test]
    fn other_shapes_are_rejected() {
        assert!(matches!(
            classify(r#"{"hello":"world"}"#),
            Err(ProtocolError::UnknownShape)
        ));
        assert!(matches!(classify("[1,2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(
            classify(r#"{"notification":{"data":1}}"#),
            Err(ProtocolError::InvalidNotification(_))
        ));
        assert!(matches!(
            classify(r#"{"id":null,"success":true}"#),
            Err(ProtocolError::InvalidId(Value::Null))
        ));
    }
}

use crate::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier pairing a request with its response.
///
/// Always positive; allocated by the sender from a monotonically increasing
/// counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The raw object shape on the wire.
///
/// Every field except `version` is optional here; [`Message::try_from`]
/// decides which kind of message a given combination describes. A `result`
/// or `error` that is present but `null` decodes as `Some(Value::Null)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Success {
        id: RequestId,
        result: Value,
    },
    Failure {
        id: RequestId,
        error: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// Reasons an inbound unit is dropped instead of dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedMessage {
    /// Not valid JSON, not an object, or a field of the wrong type.
    Json(String),
    /// The version tag is not [`PROTOCOL_VERSION`].
    VersionMismatch(String),
    /// The identifier is zero.
    InvalidId,
    /// No method, and no identifier or an identifier with neither `result`
    /// nor `error`.
    Unclassified,
    /// The line exceeded the codec's maximum length.
    TooLong,
}

impl fmt::Display for MalformedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "invalid message: {}", e),
            Self::VersionMismatch(v) => write!(f, "unsupported protocol version '{}'", v),
            Self::InvalidId => write!(f, "request id must be a positive integer"),
            Self::Unclassified => {
                write!(f, "message is not a request, response or notification")
            }
            Self::TooLong => write!(f, "message exceeds maximum line length"),
        }
    }
}

impl std::error::Error for MalformedMessage {}

impl Message {
    /// Parses one delimited unit into a message.
    pub fn parse(line: &str) -> Result<Self, MalformedMessage> {
        let envelope: Envelope =
            serde_json::from_str(line).map_err(|e| MalformedMessage::Json(e.to_string()))?;
        Self::try_from(envelope)
    }

    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    /// Returns the identifier, if this message carries one.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Self::Request { id, .. } | Self::Success { id, .. } | Self::Failure { id, .. } => {
                Some(*id)
            }
            Self::Notification { .. } => None,
        }
    }

    /// Returns the method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Success { .. } | Self::Failure { .. } => None,
        }
    }
}

impl TryFrom<Envelope> for Message {
    type Error = MalformedMessage;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        if envelope.version != PROTOCOL_VERSION {
            return Err(MalformedMessage::VersionMismatch(envelope.version));
        }

        let id = match envelope.id {
            Some(0) => return Err(MalformedMessage::InvalidId),
            Some(id) => Some(RequestId(id)),
            None => None,
        };
        let params = envelope.params.unwrap_or(Value::Null);

        match (id, envelope.method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (Some(id), None) => match (envelope.error, envelope.result) {
                (Some(error), _) => Ok(Self::Failure { id, error }),
                (None, Some(result)) => Ok(Self::Success { id, result }),
                (None, None) => Err(MalformedMessage::Unclassified),
            },
            (None, None) => Err(MalformedMessage::Unclassified),
        }
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        let version = PROTOCOL_VERSION.to_string();
        match message {
            Message::Request { id, method, params } => Self {
                version,
                id: Some(id.0),
                method: Some(method),
                params: Some(params),
                ..Default::default()
            },
            Message::Success { id, result } => Self {
                version,
                id: Some(id.0),
                result: Some(result),
                ..Default::default()
            },
            Message::Failure { id, error } => Self {
                version,
                id: Some(id.0),
                error: Some(error),
                ..Default::default()
            },
            Message::Notification { method, params } => Self {
                version,
                method: Some(method),
                params: Some(params),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod parse {
        use super::*;

        #[test]
        fn request_with_params() {
            let msg = Message::parse(
                r#"{"version":"v1","id":1,"method":"stat","params":{"path":"/a.txt"}}"#,
            )
            .unwrap();
            assert_eq!(
                msg,
                Message::Request {
                    id: RequestId(1),
                    method: "stat".to_string(),
                    params: json!({"path": "/a.txt"}),
                }
            );
        }

        #[test]
        fn success_response() {
            let msg = Message::parse(r#"{"version":"v1","id":7,"result":{"exists":true}}"#).unwrap();
            assert_eq!(
                msg,
                Message::Success {
                    id: RequestId(7),
                    result: json!({"exists": true}),
                }
            );
        }

        #[test]
        fn null_result_is_success() {
            let msg = Message::parse(r#"{"version":"v1","id":3,"result":null}"#).unwrap();
            assert_eq!(
                msg,
                Message::Success {
                    id: RequestId(3),
                    result: Value::Null,
                }
            );
        }

        #[test]
        fn rejects_response_without_result_or_error() {
            let err = Message::parse(r#"{"version":"v1","id":4}"#).unwrap_err();
            assert_eq!(err, MalformedMessage::Unclassified);
        }

        #[test]
        fn error_response_with_string() {
            let msg = Message::parse(r#"{"version":"v1","id":2,"error":"ENOENT"}"#).unwrap();
            assert_eq!(
                msg,
                Message::Failure {
                    id: RequestId(2),
                    error: json!("ENOENT"),
                }
            );
        }

        #[test]
        fn notification_without_id() {
            let msg =
                Message::parse(r#"{"version":"v1","method":"fileChanged","params":{}}"#).unwrap();
            assert_eq!(msg.id(), None);
            assert_eq!(msg.method(), Some("fileChanged"));
        }

        #[test]
        fn rejects_non_json() {
            let err = Message::parse("not json at all").unwrap_err();
            assert!(matches!(err, MalformedMessage::Json(_)));
        }

        #[test]
        fn rejects_non_object() {
            let err = Message::parse("[1, 2, 3]").unwrap_err();
            assert!(matches!(err, MalformedMessage::Json(_)));
        }

        #[test]
        fn rejects_missing_version() {
            let err = Message::parse(r#"{"id":1,"result":{}}"#).unwrap_err();
            assert!(matches!(err, MalformedMessage::Json(_)));
        }

        #[test]
        fn rejects_version_mismatch() {
            let err = Message::parse(r#"{"version":"v2","id":1,"result":{}}"#).unwrap_err();
            assert_eq!(err, MalformedMessage::VersionMismatch("v2".to_string()));
        }

        #[test]
        fn rejects_zero_id() {
            let err = Message::parse(r#"{"version":"v1","id":0,"result":{}}"#).unwrap_err();
            assert_eq!(err, MalformedMessage::InvalidId);
        }

        #[test]
        fn rejects_negative_id() {
            let err = Message::parse(r#"{"version":"v1","id":-4,"result":{}}"#).unwrap_err();
            assert!(matches!(err, MalformedMessage::Json(_)));
        }

        #[test]
        fn rejects_message_without_id_or_method() {
            let err = Message::parse(r#"{"version":"v1","result":{}}"#).unwrap_err();
            assert_eq!(err, MalformedMessage::Unclassified);
        }
    }

    mod envelope {
        use super::*;

        #[test]
        fn request_has_wire_shape() {
            let msg = Message::request(RequestId(1), "stat", json!({"path": "/a.txt"}));
            let value = serde_json::to_value(Envelope::from(msg)).unwrap();
            assert_eq!(
                value,
                json!({"version": "v1", "id": 1, "method": "stat", "params": {"path": "/a.txt"}})
            );
        }

        #[test]
        fn notification_omits_id() {
            let msg = Message::notification("fileChanged", json!({"path": "/x"}));
            let value = serde_json::to_value(Envelope::from(msg)).unwrap();
            assert!(value.get("id").is_none());
            assert_eq!(value["version"], "v1");
        }

        #[test]
        fn failure_omits_result() {
            let msg = Message::Failure {
                id: RequestId(9),
                error: json!({"code": "ENOENT"}),
            };
            let value = serde_json::to_value(Envelope::from(msg)).unwrap();
            assert!(value.get("result").is_none());
            assert_eq!(value["error"]["code"], "ENOENT");
        }
    }
}

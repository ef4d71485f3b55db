//! Client-facing frame shapes.
//!
//! Every frame the router itself produces is a JSON object with a `type`
//! field. Client frames are only inspected far enough to decide whether
//! to forward them; forwarded frames pass through byte for byte.

use serde::Serialize;
use serde_json::Value;

use switchyard_core::{ConnectionId, InstanceId};

pub const AUTHENTICATION_FAILED: &str = "Authentication failed";
pub const NO_INSTANCES_AVAILABLE: &str = "No instances available";
pub const INSTANCE_UNAVAILABLE: &str = "Instance unavailable";
pub const INVALID_MESSAGE_FORMAT: &str = "Invalid message format";
pub const UNKNOWN_MESSAGE_TYPE: &str = "Unknown message type";

/// Client frame types forwarded to the instance unmodified.
pub const FORWARDED_TYPES: [&str; 4] = ["request", "response", "notification", "message"];

/// Frames sent by the router to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Pre-auth ack, sent as soon as the socket opens.
    Connection {
        status: &'static str,
        connection_id: ConnectionId,
    },
    /// The connection is bound to an instance and proxying.
    Routing {
        status: &'static str,
        instance_id: InstanceId,
        connection_id: ConnectionId,
    },
    Error {
        error: &'static str,
    },
    Pong,
}

impl ServerFrame {
    pub fn connected(connection_id: &str) -> Self {
        ServerFrame::Connection {
            status: "connected",
            connection_id: connection_id.to_string(),
        }
    }

    pub fn routed(instance_id: &str, connection_id: &str) -> Self {
        ServerFrame::Routing {
            status: "connected",
            instance_id: instance_id.to_string(),
            connection_id: connection_id.to_string(),
        }
    }

    pub fn error(error: &'static str) -> Self {
        ServerFrame::Error { error }
    }

    pub fn to_json(&self) -> String {
        // Serializing a plain enum of strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// What to do with a text frame received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Forward the original text to the instance.
    Forward,
    /// Answer locally with a pong.
    Ping,
    /// Not a JSON object.
    Invalid,
    /// A JSON object whose `type` is missing or not recognised.
    Unknown,
}

/// Classify a client text frame.
pub fn classify(text: &str) -> ClientFrame {
    let Ok(Value::Object(frame)) = serde_json::from_str::<Value>(text) else {
        return ClientFrame::Invalid;
    };
    match frame.get("type").and_then(Value::as_str) {
        Some("ping") => ClientFrame::Ping,
        Some(t) if FORWARDED_TYPES.contains(&t) => ClientFrame::Forward,
        _ => ClientFrame::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_ack_shape() {
        let frame: Value = serde_json::from_str(&ServerFrame::connected("conn-1").to_json()).unwrap();
        assert_eq!(
            frame,
            json!({"type": "connection", "status": "connected", "connectionId": "conn-1"})
        );
    }

    #[test]
    fn routing_ack_shape() {
        let frame: Value =
            serde_json::from_str(&ServerFrame::routed("inst-1", "conn-1").to_json()).unwrap();
        assert_eq!(
            frame,
            json!({
                "type": "routing",
                "status": "connected",
                "instanceId": "inst-1",
                "connectionId": "conn-1"
            })
        );
    }

    #[test]
    fn error_and_pong_shapes() {
        let frame: Value =
            serde_json::from_str(&ServerFrame::error(INVALID_MESSAGE_FORMAT).to_json()).unwrap();
        assert_eq!(frame, json!({"type": "error", "error": "Invalid message format"}));
        assert_eq!(ServerFrame::Pong.to_json(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn classify_forwarded_types() {
        for t in FORWARDED_TYPES {
            let text = json!({"type": t, "id": 1, "payload": {"x": 1}}).to_string();
            assert_eq!(classify(&text), ClientFrame::Forward, "type {t}");
        }
    }

    #[test]
    fn classify_ping() {
        assert_eq!(classify(r#"{"type":"ping"}"#), ClientFrame::Ping);
    }

    #[test]
    fn classify_invalid() {
        assert_eq!(classify("not json"), ClientFrame::Invalid);
        assert_eq!(classify("[1,2,3]"), ClientFrame::Invalid);
        assert_eq!(classify(r#""request""#), ClientFrame::Invalid);
        assert_eq!(classify(""), ClientFrame::Invalid);
    }

    #[test]
    fn classify_unknown() {
        assert_eq!(classify(r#"{"type":"subscribe"}"#), ClientFrame::Unknown);
        assert_eq!(classify(r#"{"id":1}"#), ClientFrame::Unknown);
        assert_eq!(classify(r#"{"type":7}"#), ClientFrame::Unknown);
    }
}

//! Socket frame types.
//!
//! Frames exchanged with browser clients are JSON objects carrying at least
//! a `topic`. Outbound frames use [`WebsocketMessage`]; inbound frames are
//! kept as raw JSON in an [`InboundFrame`] so handlers of forward-compatible
//! topics can read whatever fields they need.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;

/// Topics with a meaning to the server itself.
pub mod topics {
    /// Error report sent to a client.
    pub const ERROR: &str = "error";
    /// Direct or room-wide chat message.
    pub const CHAT: &str = "chat";
    /// Application-level keepalive.
    pub const PING: &str = "ping";
    /// Reply to [`PING`].
    pub const PONG: &str = "pong";
}

/// Sender name used for messages originating from the server.
pub const SYSTEM_SENDER: &str = "system";

/// Outbound socket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketMessage<T = Value> {
    /// Topic identifying the payload type.
    pub topic: String,
    /// Topic-specific payload.
    pub payload: T,
}

impl<T> WebsocketMessage<T> {
    /// Create a new socket message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: T) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

impl WebsocketMessage<ErrorPayload> {
    /// Create an error frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            topics::ERROR,
            ErrorPayload {
                message: message.into(),
            },
        )
    }
}

/// Payload of an error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error message.
    pub message: String,
}

/// Room membership notice broadcast when a member joins or leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberNotice {
    /// `members/join` or `members/left`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The member concerned.
    pub member: String,
}

impl MemberNotice {
    /// Notice type for a joining member.
    pub const JOIN: &'static str = "members/join";
    /// Notice type for a departing member.
    pub const LEFT: &'static str = "members/left";

    /// Notice for a member that joined.
    #[must_use]
    pub fn joined(member: impl Into<String>) -> Self {
        Self {
            kind: Self::JOIN.to_string(),
            member: member.into(),
        }
    }

    /// Notice for a member that left.
    #[must_use]
    pub fn left(member: impl Into<String>) -> Self {
        Self {
            kind: Self::LEFT.to_string(),
            member: member.into(),
        }
    }
}

/// A message addressed to one member by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    /// Always [`SYSTEM_SENDER`] for server-originated messages.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub sender: String,
    /// Target member.
    pub recipient: String,
    /// Message kind, e.g. `error`.
    #[serde(rename = "type", skip_serializing_if = "String::is_empty", default)]
    pub kind: String,
    /// Optional metadata.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<Value>,
    /// Message body.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<Value>,
}

impl SystemMessage {
    /// Create a system message for `recipient`.
    #[must_use]
    pub fn new(recipient: impl Into<String>, kind: impl Into<String>, message: Value) -> Self {
        Self {
            sender: SYSTEM_SENDER.to_string(),
            recipient: recipient.into(),
            kind: kind.into(),
            meta: None,
            message: Some(message),
        }
    }
}

/// A decoded inbound socket frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    topic: String,
    raw: Value,
}

impl InboundFrame {
    /// Parse a frame from raw socket data.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not a JSON object or has no
    /// non-empty string `topic`.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let raw: Value = serde_json::from_slice(data)?;
        Self::from_value(raw)
    }

    /// Build a frame from an already decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value has no non-empty string `topic`.
    pub fn from_value(raw: Value) -> Result<Self, ProtocolError> {
        if !raw.is_object() {
            return Err(ProtocolError::Invalid("frame must be a JSON object".into()));
        }
        let topic = match raw.get("topic").and_then(Value::as_str) {
            Some(topic) if !topic.is_empty() => topic.to_string(),
            _ => return Err(ProtocolError::MissingTopic),
        };
        Ok(Self { topic, raw })
    }

    /// The frame topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The value handed to topic handlers.
    ///
    /// This is the `payload` field when present and non-null, otherwise the
    /// whole frame.
    #[must_use]
    pub fn payload(&self) -> &Value {
        match self.raw.get("payload") {
            Some(payload) if !payload.is_null() => payload,
            _ => &self.raw,
        }
    }

    /// The `recipient` field, if any.
    #[must_use]
    pub fn recipient(&self) -> Option<&str> {
        self.raw.get("recipient").and_then(Value::as_str)
    }

    /// The raw JSON object.
    #[must_use]
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

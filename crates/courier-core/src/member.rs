//! Room members and their outbound connection handles.
//!
//! A member never touches its socket directly. It owns the sending half of a
//! bounded queue that the connection's writer task drains, so writes from
//! handlers, broadcasts and bus commands never wait on network I/O.

use bytes::Bytes;
use courier_protocol::envelope::now_millis;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A member identifier, unique within a room.
pub type MemberId = String;

/// Default outbound queue capacity per member.
pub const DEFAULT_MEMBER_BUFFER: usize = 256;

/// Errors raised when writing to a member.
#[derive(Debug, Error)]
pub enum MemberError {
    /// The member's connection has gone away.
    #[error("member {0} is disconnected")]
    Disconnected(MemberId),

    /// The member's outbound queue is full.
    #[error("member {0} is not keeping up, message dropped")]
    Backpressure(MemberId),

    /// The message could not be serialized.
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame, written verbatim.
    Binary(Bytes),
    /// Close the connection.
    Close,
}

/// A message body, disambiguated at the serialization boundary.
///
/// Raw bytes are sent verbatim, strings as text frames and anything else
/// as JSON text.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Raw bytes.
    Bytes(Bytes),
    /// Text.
    Text(String),
    /// Structured value, serialized as JSON.
    Json(Value),
}

impl MessageBody {
    /// Serialize any value into a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, MemberError> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Convert into the frame handed to the writer task.
    ///
    /// # Errors
    ///
    /// Returns an error if a JSON body cannot be rendered.
    pub fn into_outbound(self) -> Result<Outbound, MemberError> {
        Ok(match self {
            Self::Bytes(bytes) => Outbound::Binary(bytes),
            Self::Text(text) => Outbound::Text(text),
            Self::Json(value) => Outbound::Text(serde_json::to_string(&value)?),
        })
    }
}

impl From<Bytes> for MessageBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for MessageBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<String> for MessageBody {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for MessageBody {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for MessageBody {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// A connected client within a room.
#[derive(Debug)]
pub struct Member {
    id: MemberId,
    joined_at: u64,
    connection: mpsc::Sender<Outbound>,
}

impl Member {
    /// Create a member writing into an existing outbound queue.
    #[must_use]
    pub fn new(id: impl Into<MemberId>, connection: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: id.into(),
            joined_at: now_millis(),
            connection,
        }
    }

    /// Create a member together with the receiving end of its queue.
    #[must_use]
    pub fn channel(id: impl Into<MemberId>, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id, tx), rx)
    }

    /// The member identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the member joined, in unix milliseconds.
    #[must_use]
    pub fn joined_at(&self) -> u64 {
        self.joined_at
    }

    /// Whether the writer task is still draining the queue.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.connection.is_closed()
    }

    /// Queue a message for this member.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be serialized, the queue is full,
    /// or the connection is gone.
    pub fn send(&self, body: impl Into<MessageBody>) -> Result<(), MemberError> {
        self.send_outbound(body.into().into_outbound()?)
    }

    /// Queue an already rendered frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is full or the connection is gone.
    pub fn send_outbound(&self, frame: Outbound) -> Result<(), MemberError> {
        self.connection.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => MemberError::Backpressure(self.id.clone()),
            TrySendError::Closed(_) => MemberError::Disconnected(self.id.clone()),
        })
    }

    /// Ask the writer task to close the connection.
    pub fn close(&self) {
        // A full or closed queue means the connection is already going away.
        let _ = self.connection.try_send(Outbound::Close);
    }
}

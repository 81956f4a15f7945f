//! The durable bus envelope.
//!
//! Every command and event travels through the transport wrapped in an
//! [`Envelope`]. The envelope name is the logical message type name and
//! doubles as the topic and routing key.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A unique envelope identifier, unique across processes.
pub type EnvelopeId = Uuid;

/// Well-known metadata keys.
pub mod metadata {
    /// Unix milliseconds at which a command was sent.
    pub const SENT_AT: &str = "sent_at";
    /// Unix milliseconds at which an event was published.
    pub const PUBLISHED_AT: &str = "published_at";
    /// Identifier shared by every message caused by the same trigger.
    pub const CORRELATION_ID: &str = "correlation_id";
    /// Topic the envelope was consumed from before being dead-lettered.
    pub const DEAD_LETTER_TOPIC: &str = "dead_letter.topic";
    /// Final handler error of a dead-lettered envelope.
    pub const DEAD_LETTER_REASON: &str = "dead_letter.reason";
    /// Number of handler invocations before the envelope was dead-lettered.
    pub const DEAD_LETTER_ATTEMPTS: &str = "dead_letter.attempts";
}

/// Generate a unique envelope ID.
#[must_use]
pub fn generate_envelope_id() -> EnvelopeId {
    Uuid::new_v4()
}

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A durable message wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier, stable across retries and redeliveries.
    pub id: EnvelopeId,
    /// Logical message type name (topic).
    pub name: String,
    /// Marshaled message body.
    pub payload: Bytes,
    /// Trace and timestamp fields.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Envelope {
    /// Create a new envelope with a fresh ID and empty metadata.
    #[must_use]
    pub fn new(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_envelope_id(),
            name: name.into(),
            payload: payload.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set a metadata entry, replacing any previous value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Look up a metadata entry.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// The correlation ID, falling back to the envelope's own ID.
    #[must_use]
    pub fn correlation_id(&self) -> String {
        self.metadata(metadata::CORRELATION_ID)
            .map(str::to_string)
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

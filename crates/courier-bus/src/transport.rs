//! Transport abstraction traits for the bus.
//!
//! A transport moves envelopes between publishers and consumer groups. It
//! owns delivery offsets and redelivery; the router above it only sees a
//! stream of [`Delivery`] values to acknowledge.

use async_trait::async_trait;
use courier_protocol::Envelope;
use std::fmt;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport was closed.
    #[error("transport closed")]
    Closed,

    /// Connecting to the backend failed.
    #[error("failed to connect to {backend}: {reason}")]
    Connect {
        /// Backend name.
        backend: &'static str,
        /// Backend-specific reason.
        reason: String,
    },

    /// Publishing failed.
    #[error("publish to {topic} failed: {reason}")]
    Publish {
        /// Target topic.
        topic: String,
        /// Backend-specific reason.
        reason: String,
    },

    /// Subscribing failed.
    #[error("subscribe to {topic} as {group} failed: {reason}")]
    Subscribe {
        /// Topic.
        topic: String,
        /// Consumer group.
        group: String,
        /// Backend-specific reason.
        reason: String,
    },

    /// Receiving the next delivery failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// Acknowledging a delivery failed.
    #[error("acknowledgement failed: {0}")]
    Ack(String),

    /// An envelope could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] courier_protocol::ProtocolError),
}

/// Settles one delivery with its transport.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// The message was handled; never deliver it to this group again.
    async fn ack(&self) -> Result<(), TransportError>;

    /// The message was not handled; deliver it to this group again.
    async fn nack(&self) -> Result<(), TransportError>;
}

/// One message handed to a consumer.
pub struct Delivery {
    envelope: Envelope,
    attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    /// Create a delivery.
    #[must_use]
    pub fn new(envelope: Envelope, attempt: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            attempt,
            acker,
        }
    }

    /// The delivered envelope.
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// How many times the transport has handed this envelope to the group,
    /// starting at 1.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the acknowledgement.
    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    /// Reject the delivery so it is redelivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the request.
    pub async fn nack(self) -> Result<(), TransportError> {
        self.acker.nack().await
    }
}

/// A consumer's view of one topic within a consumer group.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery.
    ///
    /// Returns `None` once the transport is closed.
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError>;
}

/// Where a newly created consumer group starts reading.
///
/// An existing group always resumes from its own position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// The oldest retained message.
    #[default]
    Earliest,
    /// Only messages published after the group was created.
    Latest,
}

/// A publish/subscribe backend.
///
/// Every consumer group sees every message published to a topic; within one
/// group, each message goes to one subscription at a time.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Transport name for logs (e.g., "memory", "redis").
    fn name(&self) -> &'static str;

    /// Append an envelope to a topic.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Join `group` on `topic`, creating either as needed. A new group
    /// starts reading at `start`.
    async fn subscribe_from(
        &self,
        topic: &str,
        group: &str,
        start: StartFrom,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Join `group` on `topic`; a new group sees every retained message.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        self.subscribe_from(topic, group, StartFrom::Earliest).await
    }

    /// Close the transport, ending every subscription.
    async fn close(&self) -> Result<(), TransportError>;
}

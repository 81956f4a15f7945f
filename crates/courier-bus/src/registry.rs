//! Command and event handler registration.
//!
//! Handlers are collected on a [`HandlerRegistry`] which is then moved into
//! the bus. Once the bus owns it nothing can be added, so every handler is
//! known when the processor graph is built.

use crate::bus::HandlerContext;
use crate::message::{unmarshal, Message};
use async_trait::async_trait;
use courier_protocol::Envelope;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by command and event handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler failed; the message will be retried.
    #[error("{0}")]
    Failed(String),

    /// The handler panicked; the message will be retried.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The payload did not decode into the handler's message type.
    #[error("failed to decode {name}: {source}")]
    Decode {
        /// Message type name.
        name: &'static str,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
}

impl HandlerError {
    /// A handler failure carrying `error`'s message.
    pub fn failed(error: impl fmt::Display) -> Self {
        Self::Failed(error.to_string())
    }
}

/// Which processes of a service handle a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// One process of the service handles each message.
    #[default]
    Shared,
    /// Every process of the service handles each message.
    Broadcast,
}

/// Whether a handler consumes commands or events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Exactly one handler per topic.
    Command,
    /// Any number of handlers per topic.
    Event,
}

impl HandlerKind {
    /// Lowercase label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Event => "event",
        }
    }
}

/// Handles one command type.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// The handled command.
    type Command: Message;

    /// Handler name for logs, metrics and consumer groups.
    fn name(&self) -> &'static str;

    /// Delivery mode of the handler's subscription.
    fn delivery(&self) -> DeliveryMode {
        DeliveryMode::Shared
    }

    /// Handle one command.
    async fn handle(
        &self,
        ctx: &HandlerContext,
        command: Self::Command,
    ) -> Result<(), HandlerError>;
}

/// Handles one event type.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// The handled event.
    type Event: Message;

    /// Handler name for logs, metrics and consumer groups.
    fn name(&self) -> &'static str;

    /// Delivery mode of the handler's subscription.
    fn delivery(&self) -> DeliveryMode {
        DeliveryMode::Shared
    }

    /// Handle one event.
    async fn handle(&self, ctx: &HandlerContext, event: Self::Event) -> Result<(), HandlerError>;
}

/// A handler with its message type erased.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn call(&self, ctx: HandlerContext, envelope: Envelope) -> Result<(), HandlerError>;
}

struct CommandAdapter<H>(H);

#[async_trait]
impl<H: CommandHandler> ErasedHandler for CommandAdapter<H> {
    async fn call(&self, ctx: HandlerContext, envelope: Envelope) -> Result<(), HandlerError> {
        let command = decode::<H::Command>(&envelope)?;
        self.0.handle(&ctx, command).await
    }
}

struct EventAdapter<H>(H);

#[async_trait]
impl<H: EventHandler> ErasedHandler for EventAdapter<H> {
    async fn call(&self, ctx: HandlerContext, envelope: Envelope) -> Result<(), HandlerError> {
        let event = decode::<H::Event>(&envelope)?;
        self.0.handle(&ctx, event).await
    }
}

fn decode<M: Message>(envelope: &Envelope) -> Result<M, HandlerError> {
    unmarshal(envelope).map_err(|source| HandlerError::Decode {
        name: M::NAME,
        source,
    })
}

/// A registered handler.
#[derive(Clone)]
pub struct Registration {
    pub(crate) topic: &'static str,
    pub(crate) name: &'static str,
    pub(crate) kind: HandlerKind,
    pub(crate) delivery: DeliveryMode,
    pub(crate) handler: Arc<dyn ErasedHandler>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("topic", &self.topic)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("delivery", &self.delivery)
            .finish()
    }
}

impl Registration {
    /// Topic the handler subscribes to.
    #[must_use]
    pub fn topic(&self) -> &'static str {
        self.topic
    }

    /// Handler name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Command or event.
    #[must_use]
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Delivery mode.
    #[must_use]
    pub fn delivery(&self) -> DeliveryMode {
        self.delivery
    }
}

/// Collects command and event handlers before the bus is built.
///
/// The registry accepts anything; duplicate command handlers are rejected
/// when the bus builds its processors.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    commands: Vec<Registration>,
    events: Vec<Registration>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command handler.
    pub fn add_command_handler<H: CommandHandler>(&mut self, handler: H) -> &mut Self {
        self.commands.push(Registration {
            topic: <H::Command as Message>::NAME,
            name: handler.name(),
            kind: HandlerKind::Command,
            delivery: handler.delivery(),
            handler: Arc::new(CommandAdapter(handler)),
        });
        self
    }

    /// Register an event handler.
    pub fn add_event_handler<H: EventHandler>(&mut self, handler: H) -> &mut Self {
        self.events.push(Registration {
            topic: <H::Event as Message>::NAME,
            name: handler.name(),
            kind: HandlerKind::Event,
            delivery: handler.delivery(),
            handler: Arc::new(EventAdapter(handler)),
        });
        self
    }

    /// Registered command handlers, in registration order.
    #[must_use]
    pub fn command_handlers(&self) -> &[Registration] {
        &self.commands
    }

    /// Registered event handlers, in registration order.
    #[must_use]
    pub fn event_handlers(&self) -> &[Registration] {
        &self.events
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.events.is_empty()
    }
}

//! # courier-bus
//!
//! Durable, retrying command and event bus for Courier.
//!
//! - **Message** - Typed commands and events, JSON on the wire
//! - **Transport** - Publish/subscribe backends with consumer groups
//! - **Retry** - Exponential backoff and terminal failure hooks
//! - **Router** - Consumer workers per handler subscription
//! - **Bus** - Lazily started facade for sending and publishing
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ send/publish ┌─────────────┐     ┌─────────────┐
//! │     Bus     │─────────────▶│  Transport  │────▶│   Router    │
//! └─────────────┘              └─────────────┘     └─────────────┘
//!        ▲                                                │
//!        │ HandlerContext                                 ▼
//!        │                     ┌─────────────┐     ┌─────────────┐
//!        └─────────────────────│   Handler   │◀────│   Retrier   │
//!                              └─────────────┘     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use courier_bus::{
//!     Bus, BusConfig, CommandHandler, HandlerContext, HandlerError, HandlerRegistry, Message,
//!     MemoryTransport,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Greet {
//!     who: String,
//! }
//!
//! impl Message for Greet {
//!     const NAME: &'static str = "Greet";
//! }
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl CommandHandler for Greeter {
//!     type Command = Greet;
//!
//!     fn name(&self) -> &'static str {
//!         "greeter"
//!     }
//!
//!     async fn handle(&self, _ctx: &HandlerContext, cmd: Greet) -> Result<(), HandlerError> {
//!         println!("hello {}", cmd.who);
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), courier_bus::BusError> {
//! let mut registry = HandlerRegistry::new();
//! registry.add_command_handler(Greeter);
//!
//! let bus = Bus::new(Arc::new(MemoryTransport::new()), registry, BusConfig::default());
//! bus.send(&Greet { who: "bob".into() }).await?;
//! bus.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod memory;
pub mod message;
#[cfg(feature = "redis")]
pub mod redis;
pub mod registry;
pub mod retry;
pub mod router;
pub mod transport;

pub use bus::{Bus, BusBuilder, BusConfig, BusError, HandlerContext};
pub use memory::MemoryTransport;
pub use message::Message;
pub use registry::{
    CommandHandler, DeliveryMode, EventHandler, HandlerError, HandlerKind, HandlerRegistry,
};
pub use retry::{DeadLetter, Failure, FailureHook, LogAndDrop, OnRetry, RetryPolicy};
pub use router::RouterConfig;
pub use transport::{Delivery, StartFrom, Subscription, Transport, TransportError};

#[cfg(feature = "redis")]
pub use crate::redis::RedisTransport;

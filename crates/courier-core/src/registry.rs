//! Socket topic registry and dispatch.
//!
//! Inbound socket frames are routed by their `topic` to every handler
//! registered for it. Handlers run concurrently, each in its own task, and
//! a failing or panicking handler never prevents the others from running.

use crate::manager::RoomManager;
use crate::member::{Member, MemberError};
use crate::room::{Room, RoomError};
use async_trait::async_trait;
use courier_protocol::{panic_message, InboundFrame};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

/// Everything a topic handler may touch for the frame's sender.
#[derive(Debug, Clone)]
pub struct SocketContext {
    /// The sender's room.
    pub room: Arc<Room>,
    /// The sender.
    pub member: Arc<Member>,
    /// All rooms of this process.
    pub rooms: Arc<RoomManager>,
}

impl SocketContext {
    /// Create a context.
    #[must_use]
    pub fn new(room: Arc<Room>, member: Arc<Member>, rooms: Arc<RoomManager>) -> Self {
        Self {
            room,
            member,
            rooms,
        }
    }
}

/// Errors returned by a single topic handler.
#[derive(Debug, Error)]
pub enum SocketHandlerError {
    /// A room operation failed.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// Writing to a member failed.
    #[error(transparent)]
    Member(#[from] MemberError),

    /// The handler failed.
    #[error("{0}")]
    Failed(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// One handler's failure within a dispatch.
#[derive(Debug)]
pub struct HandlerFailure {
    /// Name of the failed handler.
    pub handler: &'static str,
    /// What went wrong.
    pub error: SocketHandlerError,
}

/// Aggregated failures of one dispatched frame.
#[derive(Debug)]
pub struct DispatchError {
    /// The dispatched topic.
    pub topic: String,
    /// Failures, one per failed handler.
    pub failures: Vec<HandlerFailure>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} handler(s) failed for topic {}", self.failures.len(), self.topic)?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.handler, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for DispatchError {}

/// A handler for one socket topic.
#[async_trait]
pub trait TopicHandler: Send + Sync + 'static {
    /// Handler name, used in logs and error reports.
    fn name(&self) -> &'static str;

    /// Handle one inbound frame.
    async fn handle(
        &self,
        ctx: Arc<SocketContext>,
        frame: Arc<InboundFrame>,
    ) -> Result<(), SocketHandlerError>;
}

/// A [`TopicHandler`] backed by an async closure.
pub struct FnHandler<F> {
    name: &'static str,
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

/// Wrap an async closure as a topic handler.
pub fn handler_fn<F, Fut>(name: &'static str, f: F) -> FnHandler<F>
where
    F: Fn(Arc<SocketContext>, Arc<InboundFrame>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SocketHandlerError>> + Send + 'static,
{
    FnHandler { name, f }
}

#[async_trait]
impl<F, Fut> TopicHandler for FnHandler<F>
where
    F: Fn(Arc<SocketContext>, Arc<InboundFrame>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SocketHandlerError>> + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(
        &self,
        ctx: Arc<SocketContext>,
        frame: Arc<InboundFrame>,
    ) -> Result<(), SocketHandlerError> {
        (self.f)(ctx, frame).await
    }
}

/// Maps socket topics to their handlers.
///
/// Built once before the server starts, then shared behind an `Arc`.
#[derive(Default)]
pub struct TopicRegistry {
    handlers: HashMap<String, Vec<Arc<dyn TopicHandler>>>,
}

impl fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (topic, handlers) in &self.handlers {
            let names: Vec<&str> = handlers.iter().map(|h| h.name()).collect();
            map.entry(topic, &names);
        }
        map.finish()
    }
}

impl TopicRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `topic`. Handlers accumulate; none is replaced.
    pub fn register(&mut self, topic: impl Into<String>, handler: impl TopicHandler) -> &mut Self {
        let topic = topic.into();
        debug!(topic = %topic, handler = handler.name(), "Registered socket handler");
        self.handlers
            .entry(topic)
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Handlers registered for `topic`, in registration order.
    #[must_use]
    pub fn handlers_for(&self, topic: &str) -> &[Arc<dyn TopicHandler>] {
        self.handlers.get(topic).map_or(&[], Vec::as_slice)
    }

    /// Run every handler for the frame's topic and wait for all of them.
    ///
    /// A topic without handlers is not an error.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] listing every handler that failed or
    /// panicked.
    pub async fn dispatch(
        &self,
        ctx: &Arc<SocketContext>,
        frame: InboundFrame,
    ) -> Result<(), DispatchError> {
        let handlers = self.handlers_for(frame.topic());
        if handlers.is_empty() {
            trace!(topic = %frame.topic(), "No socket handler for topic");
            return Ok(());
        }

        let topic = frame.topic().to_string();
        let frame = Arc::new(frame);
        let mut tasks = JoinSet::new();

        for handler in handlers {
            let handler = Arc::clone(handler);
            let ctx = Arc::clone(ctx);
            let frame = Arc::clone(&frame);
            tasks.spawn(async move {
                let name = handler.name();
                let result = AssertUnwindSafe(handler.handle(ctx, frame))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(SocketHandlerError::Panicked(panic_message(&*panic))));
                (name, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((handler, Err(error))) => {
                    warn!(topic = %topic, handler, error = %error, "Socket handler failed");
                    failures.push(HandlerFailure { handler, error });
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Socket handler task aborted");
                    failures.push(HandlerFailure {
                        handler: "unknown",
                        error: SocketHandlerError::Failed(e.to_string()),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError { topic, failures })
        }
    }
}

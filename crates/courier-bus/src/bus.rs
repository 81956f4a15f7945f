//! Command and event bus.
//!
//! [`Bus`] is the one entry point application code talks to. Sending a
//! command or publishing an event marshals the message, stamps its metadata
//! and appends it to the transport. The processors that consume those
//! topics are built lazily on first use and the result of that build,
//! success or failure, is kept for the lifetime of the bus.

use crate::message::{marshal, Message};
use crate::registry::{HandlerKind, HandlerRegistry};
use crate::retry::{DeadLetter, FailureHook, LogAndDrop, OnRetry, Retrier, RetryPolicy};
use crate::router::{Route, Router, RouterConfig};
use crate::transport::{Transport, TransportError};
use courier_protocol::envelope::now_millis;
use courier_protocol::{metadata, Envelope, EnvelopeId};
use metrics::counter;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A message could not be marshaled.
    #[error("failed to encode {name}: {source}")]
    Encode {
        /// Message type name.
        name: &'static str,
        /// Encoder error.
        #[source]
        source: serde_json::Error,
    },

    /// Two handlers were registered for one command.
    #[error("command {topic} is already handled by {existing}, cannot add {duplicate}")]
    DuplicateCommandHandler {
        /// Command topic.
        topic: &'static str,
        /// Handler registered first.
        existing: &'static str,
        /// Handler registered second.
        duplicate: &'static str,
    },

    /// Two event handlers share a name on one topic.
    #[error("event handler {name} is registered twice for {topic}")]
    DuplicateEventHandler {
        /// Event topic.
        topic: &'static str,
        /// Handler name.
        name: &'static str,
    },

    /// The retry policy is unusable.
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// Building the processors failed. Every later call sees the same error.
    #[error("bus initialization failed: {0}")]
    Init(#[source] Arc<BusError>),

    /// The bus was shut down.
    #[error("bus is shut down")]
    ShutDown,
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Consumer group settings.
    pub router: RouterConfig,
    /// Retry policy for every handler.
    pub retry: RetryPolicy,
    /// Republish exhausted messages instead of dropping them.
    pub dead_letter: bool,
    /// Topic prefix for dead-lettered messages.
    pub dead_letter_prefix: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            retry: RetryPolicy::default(),
            dead_letter: false,
            dead_letter_prefix: crate::retry::DEFAULT_DEAD_LETTER_PREFIX.to_string(),
        }
    }
}

struct BusInner {
    transport: Arc<dyn Transport>,
    registry: HandlerRegistry,
    config: BusConfig,
    hook: Arc<dyn FailureHook>,
    on_retry: Option<OnRetry>,
    engine: OnceCell<Result<Router, Arc<BusError>>>,
    shut_down: AtomicBool,
}

/// Handle to the command and event bus. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("transport", &self.inner.transport.name())
            .field("service", &self.inner.config.router.service_name)
            .field("initialized", &self.inner.engine.initialized())
            .finish()
    }
}

/// Non-owning handle held by the bus's own workers.
#[derive(Clone)]
pub(crate) struct WeakBus(Weak<BusInner>);

impl WeakBus {
    pub(crate) fn upgrade(&self) -> Option<Bus> {
        self.0.upgrade().map(|inner| Bus { inner })
    }
}

/// Builds a [`Bus`].
pub struct BusBuilder {
    transport: Arc<dyn Transport>,
    registry: HandlerRegistry,
    config: BusConfig,
    hook: Option<Arc<dyn FailureHook>>,
    on_retry: Option<OnRetry>,
}

impl BusBuilder {
    /// Handlers to run.
    #[must_use]
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Bus configuration.
    #[must_use]
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the terminal failure hook.
    #[must_use]
    pub fn failure_hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Observe every retry.
    #[must_use]
    pub fn on_retry(mut self, on_retry: OnRetry) -> Self {
        self.on_retry = Some(on_retry);
        self
    }

    /// Build the bus. Nothing is subscribed until first use.
    #[must_use]
    pub fn build(self) -> Bus {
        let hook: Arc<dyn FailureHook> = match self.hook {
            Some(hook) => hook,
            None if self.config.dead_letter => Arc::new(DeadLetter::with_prefix(
                Arc::clone(&self.transport),
                self.config.dead_letter_prefix.clone(),
            )),
            None => Arc::new(LogAndDrop),
        };

        Bus {
            inner: Arc::new(BusInner {
                transport: self.transport,
                registry: self.registry,
                config: self.config,
                hook,
                on_retry: self.on_retry,
                engine: OnceCell::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

impl Bus {
    /// Start building a bus on `transport`.
    #[must_use]
    pub fn builder(transport: Arc<dyn Transport>) -> BusBuilder {
        BusBuilder {
            transport,
            registry: HandlerRegistry::new(),
            config: BusConfig::default(),
            hook: None,
            on_retry: None,
        }
    }

    /// Create a bus with the default failure hook.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, registry: HandlerRegistry, config: BusConfig) -> Self {
        Self::builder(transport)
            .registry(registry)
            .config(config)
            .build()
    }

    pub(crate) fn downgrade(&self) -> WeakBus {
        WeakBus(Arc::downgrade(&self.inner))
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// The bus configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Build the processors now instead of on first send or publish.
    ///
    /// # Errors
    ///
    /// Returns the initialization error, which is the same on every call.
    pub async fn start(&self) -> Result<(), BusError> {
        self.engine().await.map(|_| ())
    }

    /// Send a command to its single handler.
    ///
    /// Only publish-side failures are reported; handling happens later.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus failed to initialize, the command cannot
    /// be marshaled, or the transport rejects it.
    pub async fn send<C: Message>(&self, command: &C) -> Result<(), BusError> {
        self.dispatch(command, HandlerKind::Command, None).await
    }

    /// Publish an event to every handler subscribed to it.
    ///
    /// # Errors
    ///
    /// Same as [`Bus::send`].
    pub async fn publish<E: Message>(&self, event: &E) -> Result<(), BusError> {
        self.dispatch(event, HandlerKind::Event, None).await
    }

    /// Stop every worker and close the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to close.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down bus");
        if let Some(Ok(router)) = self.inner.engine.get() {
            router.shutdown().await;
        }
        self.inner.transport.close().await?;
        Ok(())
    }

    async fn dispatch<M: Message>(
        &self,
        message: &M,
        kind: HandlerKind,
        correlation_id: Option<&str>,
    ) -> Result<(), BusError> {
        self.engine().await?;

        let mut envelope = marshal(message).map_err(|source| BusError::Encode {
            name: M::NAME,
            source,
        })?;
        let stamp = match kind {
            HandlerKind::Command => metadata::SENT_AT,
            HandlerKind::Event => metadata::PUBLISHED_AT,
        };
        envelope.set_metadata(stamp, now_millis().to_string());
        let correlation_id = correlation_id.map_or_else(|| envelope.id.to_string(), str::to_string);
        envelope.set_metadata(metadata::CORRELATION_ID, correlation_id);

        debug!(topic = M::NAME, id = %envelope.id, kind = kind.as_str(), "Publishing message");
        self.inner.transport.publish(M::NAME, envelope).await?;
        counter!("courier_bus_published_total", "topic" => M::NAME, "kind" => kind.as_str())
            .increment(1);
        Ok(())
    }

    async fn engine(&self) -> Result<&Router, BusError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(BusError::ShutDown);
        }
        self.inner
            .engine
            .get_or_init(|| self.build_engine())
            .await
            .as_ref()
            .map_err(|e| BusError::Init(Arc::clone(e)))
    }

    async fn build_engine(&self) -> Result<Router, Arc<BusError>> {
        self.try_build_engine().await.map_err(|e| {
            error!(error = %e, "Bus initialization failed");
            Arc::new(e)
        })
    }

    async fn try_build_engine(&self) -> Result<Router, BusError> {
        let inner = &self.inner;
        inner
            .config
            .retry
            .validate()
            .map_err(BusError::InvalidRetryPolicy)?;

        let mut commands: HashMap<&'static str, &'static str> = HashMap::new();
        for registration in inner.registry.command_handlers() {
            if let Some(existing) = commands.insert(registration.topic(), registration.name()) {
                return Err(BusError::DuplicateCommandHandler {
                    topic: registration.topic(),
                    existing,
                    duplicate: registration.name(),
                });
            }
        }
        let mut events: HashSet<(&'static str, &'static str)> = HashSet::new();
        for registration in inner.registry.event_handlers() {
            if !events.insert((registration.topic(), registration.name())) {
                return Err(BusError::DuplicateEventHandler {
                    topic: registration.topic(),
                    name: registration.name(),
                });
            }
        }

        let routes: Vec<Route> = inner
            .registry
            .command_handlers()
            .iter()
            .chain(inner.registry.event_handlers())
            .cloned()
            .map(|registration| Route::new(registration, &inner.config.router))
            .collect();

        let mut retrier = Retrier::new(inner.config.retry.clone(), Arc::clone(&inner.hook));
        if let Some(on_retry) = &inner.on_retry {
            retrier = retrier.with_on_retry(Arc::clone(on_retry));
        }

        let router = Router::start(
            Arc::clone(&inner.transport),
            routes,
            Arc::new(retrier),
            &inner.config.router,
            self.downgrade(),
        )
        .await?;

        info!(
            transport = inner.transport.name(),
            routes = router.route_count(),
            "Bus started"
        );
        Ok(router)
    }
}

/// What a handler knows about the message it is handling.
///
/// Messages sent or published through the context carry the current
/// correlation ID.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    bus: Bus,
    envelope_id: EnvelopeId,
    correlation_id: String,
    metadata: BTreeMap<String, String>,
    attempt: u32,
    delivery_attempt: u32,
}

impl HandlerContext {
    /// Context for handling `envelope`. The router builds one per attempt;
    /// handlers can also be driven directly with one.
    #[must_use]
    pub fn new(bus: Bus, envelope: &Envelope, attempt: u32, delivery_attempt: u32) -> Self {
        Self {
            bus,
            envelope_id: envelope.id,
            correlation_id: envelope.correlation_id(),
            metadata: envelope.metadata.clone(),
            attempt,
            delivery_attempt,
        }
    }

    /// The bus.
    #[must_use]
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// ID of the envelope being handled.
    #[must_use]
    pub fn envelope_id(&self) -> EnvelopeId {
        self.envelope_id
    }

    /// Correlation ID of the envelope being handled.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// A metadata entry of the envelope being handled.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Handler attempt within this delivery, starting at 1.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Transport delivery count, starting at 1.
    #[must_use]
    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    /// Send a command carrying this message's correlation ID.
    ///
    /// # Errors
    ///
    /// Same as [`Bus::send`].
    pub async fn send<C: Message>(&self, command: &C) -> Result<(), BusError> {
        self.bus
            .dispatch(command, HandlerKind::Command, Some(&self.correlation_id))
            .await
    }

    /// Publish an event carrying this message's correlation ID.
    ///
    /// # Errors
    ///
    /// Same as [`Bus::send`].
    pub async fn publish<E: Message>(&self, event: &E) -> Result<(), BusError> {
        self.bus
            .dispatch(event, HandlerKind::Event, Some(&self.correlation_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::registry::{CommandHandler, DeliveryMode, EventHandler, HandlerError};
    use crate::retry::Failure;
    use crate::transport::{StartFrom, Subscription};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use tokio::sync::mpsc;
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Charge {
        amount: u32,
    }

    impl Message for Charge {
        const NAME: &'static str = "Charge";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Charged {
        amount: u32,
    }

    impl Message for Charged {
        const NAME: &'static str = "Charged";
    }

    /// Fails the first `fail_times` attempts, then reports the command.
    struct Flaky {
        name: &'static str,
        fail_times: u32,
        calls: Arc<AtomicU32>,
        done: mpsc::UnboundedSender<(u32, Instant)>,
    }

    #[async_trait]
    impl CommandHandler for Flaky {
        type Command = Charge;

        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, _ctx: &HandlerContext, cmd: Charge) -> Result<(), HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(HandlerError::Failed(format!("attempt {n} failed")));
            }
            let _ = self.done.send((cmd.amount, Instant::now()));
            Ok(())
        }
    }

    struct Recorder {
        name: &'static str,
        seen: mpsc::UnboundedSender<(&'static str, u32)>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        type Event = Charged;

        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, _ctx: &HandlerContext, event: Charged) -> Result<(), HandlerError> {
            let _ = self.seen.send((self.name, event.amount));
            Ok(())
        }
    }

    /// Handles `Charge` by publishing `Charged` with the inherited correlation.
    struct Chain;

    #[async_trait]
    impl CommandHandler for Chain {
        type Command = Charge;

        fn name(&self) -> &'static str {
            "chain"
        }

        async fn handle(&self, ctx: &HandlerContext, cmd: Charge) -> Result<(), HandlerError> {
            assert!(ctx.metadata(metadata::SENT_AT).is_some());
            ctx.publish(&Charged { amount: cmd.amount })
                .await
                .map_err(HandlerError::failed)
        }
    }

    #[derive(Default)]
    struct CountingHook(AtomicUsize);

    #[async_trait]
    impl FailureHook for CountingHook {
        async fn on_failure(&self, _failure: &Failure<'_>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flaky(
        fail_times: u32,
    ) -> (Flaky, Arc<AtomicU32>, mpsc::UnboundedReceiver<(u32, Instant)>) {
        let calls = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Flaky {
            name: "flaky",
            fail_times,
            calls: Arc::clone(&calls),
            done: tx,
        };
        (handler, calls, rx)
    }

    /// Default config with a fast, jitter-free retry policy.
    fn quick_config(service_name: &str, max_retries: u32, initial_interval: Duration) -> BusConfig {
        BusConfig {
            router: RouterConfig {
                service_name: service_name.to_string(),
                ..RouterConfig::default()
            },
            retry: RetryPolicy {
                max_retries,
                initial_interval,
                max_interval: initial_interval.max(Duration::from_secs(60)),
                multiplier: 2.0,
                randomization_factor: 0.0,
                max_elapsed_time: None,
            },
            ..BusConfig::default()
        }
    }

    fn memory() -> Arc<dyn Transport> {
        Arc::new(MemoryTransport::new())
    }

    #[tokio::test]
    async fn test_command_reaches_exactly_one_handler() {
        let (handler, calls, mut done) = flaky(0);
        let mut registry = HandlerRegistry::new();
        registry.add_command_handler(handler);
        let config = BusConfig {
            router: RouterConfig {
                workers_per_topic: 4,
                ..RouterConfig::default()
            },
            ..BusConfig::default()
        };
        let bus = Bus::new(memory(), registry, config);

        for amount in 0..10 {
            bus.send(&Charge { amount }).await.unwrap();
        }

        let mut amounts = Vec::new();
        for _ in 0..10 {
            let (amount, _) = timeout(Duration::from_secs(2), done.recv()).await.unwrap().unwrap();
            amounts.push(amount);
        }
        amounts.sort_unstable();
        assert_eq!(amounts, (0..10).collect::<Vec<_>>());

        // Nothing is handled twice.
        assert!(timeout(Duration::from_millis(50), done.recv()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_reaches_every_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = HandlerRegistry::new();
        for name in ["audit", "billing", "mailer"] {
            registry.add_event_handler(Recorder {
                name,
                seen: tx.clone(),
            });
        }
        let bus = Bus::new(memory(), registry, BusConfig::default());

        bus.publish(&Charged { amount: 5 }).await.unwrap();

        let mut names = Vec::new();
        for _ in 0..3 {
            let (name, amount) = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            assert_eq!(amount, 5);
            names.push(name);
        }
        names.sort_unstable();
        assert_eq!(names, ["audit", "billing", "mailer"]);
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        bus.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success_with_backoff() {
        let (handler, calls, mut done) = flaky(2);
        let mut registry = HandlerRegistry::new();
        registry.add_command_handler(handler);
        let bus = Bus::new(
            memory(),
            registry,
            quick_config("svc", 3, Duration::from_millis(100)),
        );

        let sent = Instant::now();
        bus.send(&Charge { amount: 1 }).await.unwrap();
        let (_, finished) = timeout(Duration::from_secs(5), done.recv()).await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(finished.duration_since(sent) >= Duration::from_millis(300));
        bus.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_message_hits_hook_once_and_is_acked() {
        let (handler, calls, _done) = flaky(u32::MAX);
        let hook = Arc::new(CountingHook::default());
        let transport = MemoryTransport::new();
        let mut registry = HandlerRegistry::new();
        registry.add_command_handler(handler);
        let bus = Bus::builder(Arc::new(transport.clone()))
            .registry(registry)
            .config(quick_config("svc", 2, Duration::from_millis(10)))
            .failure_hook(hook.clone())
            .build();

        bus.send(&Charge { amount: 1 }).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
        assert_eq!(transport.in_flight("Charge", "svc"), 0);
        assert_eq!(transport.retained("Charge"), 0);
        bus.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_config_republishes() {
        let (handler, _calls, _done) = flaky(u32::MAX);
        let transport = MemoryTransport::new();
        let mut dead = transport.subscribe("dead-letter.Charge", "ops").await.unwrap();
        let mut registry = HandlerRegistry::new();
        registry.add_command_handler(handler);
        let config = BusConfig {
            dead_letter: true,
            ..quick_config("svc", 1, Duration::from_millis(10))
        };
        let bus = Bus::new(Arc::new(transport.clone()), registry, config);

        bus.send(&Charge { amount: 9 }).await.unwrap();
        let delivery = timeout(Duration::from_secs(5), dead.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.envelope().metadata(metadata::DEAD_LETTER_TOPIC), Some("Charge"));
        assert_eq!(delivery.envelope().metadata(metadata::DEAD_LETTER_ATTEMPTS), Some("2"));
        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_command_handler_is_rejected() {
        let (first, _, _) = flaky(0);
        let (second, _, _) = flaky(0);
        let mut registry = HandlerRegistry::new();
        registry.add_command_handler(first).add_command_handler(second);
        let bus = Bus::new(memory(), registry, BusConfig::default());

        let err = bus.send(&Charge { amount: 1 }).await.unwrap_err();
        assert!(matches!(
            &err,
            BusError::Init(inner) if matches!(**inner, BusError::DuplicateCommandHandler { topic: "Charge", .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_event_handler_name_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = HandlerRegistry::new();
        registry
            .add_event_handler(Recorder { name: "audit", seen: tx.clone() })
            .add_event_handler(Recorder { name: "audit", seen: tx });
        let bus = Bus::new(memory(), registry, BusConfig::default());

        assert!(matches!(
            bus.start().await,
            Err(BusError::Init(inner)) if matches!(*inner, BusError::DuplicateEventHandler { .. })
        ));
    }

    /// A transport whose subscriptions always fail, counting attempts.
    struct Unreachable {
        subscribes: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Unreachable {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        async fn publish(&self, _topic: &str, _envelope: Envelope) -> Result<(), TransportError> {
            Ok(())
        }

        async fn subscribe_from(
            &self,
            topic: &str,
            group: &str,
            _start: StartFrom,
        ) -> Result<Box<dyn Subscription>, TransportError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Subscribe {
                topic: topic.to_string(),
                group: group.to_string(),
                reason: "connection refused".into(),
            })
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_init_failure_is_memoized() {
        let transport = Arc::new(Unreachable {
            subscribes: AtomicUsize::new(0),
        });
        let (handler, _, _) = flaky(0);
        let mut registry = HandlerRegistry::new();
        registry.add_command_handler(handler);
        let bus = Bus::new(transport.clone(), registry, BusConfig::default());

        let first = bus.send(&Charge { amount: 1 }).await.unwrap_err();
        let second = bus.publish(&Charged { amount: 1 }).await.unwrap_err();
        let third = bus.start().await.unwrap_err();

        let (BusError::Init(a), BusError::Init(b), BusError::Init(c)) = (first, second, third) else {
            panic!("expected init errors");
        };
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert!(matches!(*a, BusError::Transport(TransportError::Subscribe { .. })));
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_policy_fails_init() {
        let config = BusConfig {
            retry: RetryPolicy {
                multiplier: 0.0,
                ..RetryPolicy::default()
            },
            ..BusConfig::default()
        };
        let bus = Bus::new(memory(), HandlerRegistry::new(), config);
        assert!(matches!(
            bus.start().await,
            Err(BusError::Init(inner)) if matches!(*inner, BusError::InvalidRetryPolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_send_stamps_metadata() {
        let transport = MemoryTransport::new();
        let mut raw = transport.subscribe("Charge", "spy").await.unwrap();
        let bus = Bus::new(Arc::new(transport.clone()), HandlerRegistry::new(), BusConfig::default());

        bus.send(&Charge { amount: 3 }).await.unwrap();
        let delivery = raw.next().await.unwrap().unwrap();
        let envelope = delivery.envelope();
        assert_eq!(envelope.name, "Charge");
        assert!(envelope.metadata(metadata::SENT_AT).is_some());
        assert!(envelope.metadata(metadata::PUBLISHED_AT).is_none());
        assert_eq!(envelope.correlation_id(), envelope.id.to_string());
    }

    #[tokio::test]
    async fn test_context_propagates_correlation_id() {
        let transport = MemoryTransport::new();
        let mut spy = transport.subscribe("Charged", "spy").await.unwrap();
        let mut registry = HandlerRegistry::new();
        registry.add_command_handler(Chain);
        let bus = Bus::new(Arc::new(transport.clone()), registry, BusConfig::default());

        bus.send(&Charge { amount: 4 }).await.unwrap();
        let delivery = timeout(Duration::from_secs(2), spy.next()).await.unwrap().unwrap().unwrap();
        let event = delivery.envelope();

        assert!(event.metadata(metadata::PUBLISHED_AT).is_some());
        assert_ne!(event.correlation_id(), event.id.to_string());
        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_handlers_each_get_a_copy() {
        struct Everywhere {
            seen: mpsc::UnboundedSender<String>,
        }

        #[async_trait]
        impl EventHandler for Everywhere {
            type Event = Charged;

            fn name(&self) -> &'static str {
                "everywhere"
            }

            fn delivery(&self) -> DeliveryMode {
                DeliveryMode::Broadcast
            }

            async fn handle(&self, ctx: &HandlerContext, _e: Charged) -> Result<(), HandlerError> {
                let _ = self.seen.send(ctx.bus().config().router.instance_id.clone());
                Ok(())
            }
        }

        let transport: Arc<dyn Transport> = memory();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut buses = Vec::new();
        for instance in ["a", "b"] {
            let mut registry = HandlerRegistry::new();
            registry.add_event_handler(Everywhere { seen: tx.clone() });
            let config = BusConfig {
                router: RouterConfig {
                    instance_id: instance.to_string(),
                    ..RouterConfig::default()
                },
                ..BusConfig::default()
            };
            let bus = Bus::new(Arc::clone(&transport), registry, config);
            bus.start().await.unwrap();
            buses.push(bus);
        }

        buses[0].publish(&Charged { amount: 1 }).await.unwrap();

        let mut instances = Vec::new();
        for _ in 0..2 {
            instances.push(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap());
        }
        instances.sort();
        assert_eq!(instances, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_bus() {
        let bus = Bus::new(memory(), HandlerRegistry::new(), BusConfig::default());
        bus.start().await.unwrap();
        bus.shutdown().await.unwrap();

        assert!(matches!(bus.send(&Charge { amount: 1 }).await, Err(BusError::ShutDown)));
        // A second shutdown is a no-op.
        bus.shutdown().await.unwrap();
    }
}

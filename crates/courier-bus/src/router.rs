//! Message router.
//!
//! The router owns one subscription per worker per route. Each worker pulls
//! deliveries in order, runs the route's handler under the retrier and
//! settles the delivery once the handler succeeded or its retries ran out.

use crate::bus::{HandlerContext, WeakBus};
use crate::registry::{DeliveryMode, ErasedHandler, HandlerKind, Registration};
use crate::retry::{Outcome, Retrier};
use crate::transport::{Delivery, StartFrom, Subscription, Transport, TransportError};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Service name, the base of every consumer group.
    pub service_name: String,
    /// Process identity, used by broadcast consumer groups.
    pub instance_id: String,
    /// Concurrent consumers per route.
    pub workers_per_topic: usize,
    /// Wait before resubscribing after a subscription error.
    pub resubscribe_delay: Duration,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            service_name: "courier".to_string(),
            instance_id: "local".to_string(),
            workers_per_topic: 1,
            resubscribe_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Consumer group of a handler.
///
/// Commands share `<service>`; events get `<service>.<handler>` so every
/// handler sees every event; broadcast handlers additionally append the
/// instance so every process sees every message.
#[must_use]
pub fn consumer_group(
    service: &str,
    instance: &str,
    kind: HandlerKind,
    handler: &str,
    delivery: DeliveryMode,
) -> String {
    match (delivery, kind) {
        (DeliveryMode::Broadcast, _) => format!("{service}.{handler}.{instance}"),
        (DeliveryMode::Shared, HandlerKind::Command) => service.to_string(),
        (DeliveryMode::Shared, HandlerKind::Event) => format!("{service}.{handler}"),
    }
}

/// A handler bound to its subscription.
#[derive(Debug)]
pub(crate) struct Route {
    pub(crate) registration: Registration,
    pub(crate) group: String,
}

impl Route {
    pub(crate) fn new(registration: Registration, config: &RouterConfig) -> Self {
        let group = consumer_group(
            &config.service_name,
            &config.instance_id,
            registration.kind,
            registration.name,
            registration.delivery,
        );
        Self {
            registration,
            group,
        }
    }

    fn topic(&self) -> &'static str {
        self.registration.topic
    }

    /// Broadcast groups belong to one process and only see what is published
    /// while it runs.
    fn start_from(&self) -> StartFrom {
        match self.registration.delivery {
            DeliveryMode::Broadcast => StartFrom::Latest,
            DeliveryMode::Shared => StartFrom::Earliest,
        }
    }

    async fn subscribe(
        &self,
        transport: &dyn Transport,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        transport
            .subscribe_from(self.topic(), &self.group, self.start_from())
            .await
    }
}

struct Worker {
    route: Arc<Route>,
    transport: Arc<dyn Transport>,
    retrier: Arc<Retrier>,
    bus: WeakBus,
    shutdown: watch::Receiver<bool>,
    resubscribe_delay: Duration,
}

/// Running consumers for every route.
#[derive(Debug)]
pub struct Router {
    shutdown: watch::Sender<bool>,
    workers: Mutex<JoinSet<()>>,
    routes: usize,
    shutdown_timeout: Duration,
}

impl Router {
    /// Subscribe every route and spawn its workers.
    pub(crate) async fn start(
        transport: Arc<dyn Transport>,
        routes: Vec<Route>,
        retrier: Arc<Retrier>,
        config: &RouterConfig,
        bus: WeakBus,
    ) -> Result<Self, TransportError> {
        let workers_per_topic = config.workers_per_topic.max(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        // Subscribe everything before spawning so a failure leaves nothing running.
        let mut subscribed = Vec::with_capacity(routes.len() * workers_per_topic);
        for route in routes {
            let route = Arc::new(route);
            for _ in 0..workers_per_topic {
                let subscription = route.subscribe(transport.as_ref()).await?;
                subscribed.push((Arc::clone(&route), subscription));
            }
            info!(
                topic = route.topic(),
                handler = route.registration.name,
                kind = route.registration.kind.as_str(),
                group = %route.group,
                workers = workers_per_topic,
                "Route subscribed"
            );
        }

        let route_count = subscribed.len() / workers_per_topic;
        let mut workers = JoinSet::new();
        for (route, subscription) in subscribed {
            let worker = Worker {
                route,
                transport: Arc::clone(&transport),
                retrier: Arc::clone(&retrier),
                bus: bus.clone(),
                shutdown: shutdown_rx.clone(),
                resubscribe_delay: config.resubscribe_delay,
            };
            workers.spawn(worker.run(subscription));
        }

        Ok(Self {
            shutdown,
            workers: Mutex::new(workers),
            routes: route_count,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Number of routes.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes
    }

    /// Stop every worker after its current message.
    pub async fn shutdown(&self) {
        // Receivers may already be gone if every worker exited.
        let _ = self.shutdown.send(true);

        let mut workers = self.workers.lock().await;
        let drain = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "Bus worker panicked");
                    }
                }
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!("Bus workers did not stop in time, aborting them");
            workers.abort_all();
        }
        info!("Router stopped");
    }
}

impl Worker {
    async fn run(mut self, mut subscription: Box<dyn Subscription>) {
        let topic = self.route.topic();
        debug!(topic, group = %self.route.group, "Bus worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                next = subscription.next() => next,
            };

            match next {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => {
                    debug!(topic, group = %self.route.group, "Subscription closed");
                    break;
                }
                Err(e) => {
                    warn!(topic, group = %self.route.group, error = %e, "Subscription failed, resubscribing");
                    match self.resubscribe().await {
                        Some(fresh) => subscription = fresh,
                        None => break,
                    }
                }
            }
        }

        debug!(topic, group = %self.route.group, "Bus worker stopped");
    }

    async fn resubscribe(&mut self) -> Option<Box<dyn Subscription>> {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return None,
                () = tokio::time::sleep(self.resubscribe_delay) => {}
            }
            match self.route.subscribe(self.transport.as_ref()).await {
                Ok(subscription) => return Some(subscription),
                Err(TransportError::Closed) => return None,
                Err(e) => warn!(topic = self.route.topic(), error = %e, "Resubscribe failed"),
            }
        }
    }

    async fn process(&mut self, delivery: Delivery) {
        let Some(bus) = self.bus.upgrade() else {
            settle(delivery, false).await;
            return;
        };

        let route = Arc::clone(&self.route);
        let topic = route.topic();
        let handler = route.registration.name;
        let envelope = delivery.envelope().clone();
        let delivery_attempt = delivery.attempt();

        let outcome = self
            .retrier
            .run(topic, handler, &envelope, &mut self.shutdown, |attempt| {
                let ctx = HandlerContext::new(bus.clone(), &envelope, attempt, delivery_attempt);
                let invoke = Arc::clone(&route.registration.handler);
                let envelope = envelope.clone();
                async move { invoke.call(ctx, envelope).await }
            })
            .await;

        let kind = route.registration.kind.as_str();
        match outcome {
            Outcome::Succeeded { attempts } => {
                debug!(topic, handler, id = %envelope.id, attempts, "Message handled");
                counter!("courier_bus_messages_total", "topic" => topic, "kind" => kind, "outcome" => "handled").increment(1);
                settle(delivery, true).await;
            }
            Outcome::Failed { attempts, .. } => {
                counter!("courier_bus_messages_total", "topic" => topic, "kind" => kind, "outcome" => "failed").increment(1);
                debug!(topic, handler, id = %envelope.id, attempts, "Message failed terminally");
                settle(delivery, true).await;
            }
            Outcome::Interrupted { attempts } => {
                debug!(topic, handler, id = %envelope.id, attempts, "Shutdown interrupted retries, message left for redelivery");
                settle(delivery, false).await;
            }
        }
    }
}

async fn settle(delivery: Delivery, ack: bool) {
    let id = delivery.envelope().id;
    let result = if ack {
        delivery.ack().await
    } else {
        delivery.nack().await
    };
    if let Err(e) = result {
        warn!(id = %id, ack, error = %e, "Failed to settle delivery");
    }
}

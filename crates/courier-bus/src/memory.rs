//! In-memory log transport.
//!
//! Each topic is an append-only log addressed by offset. Consumer groups keep
//! their own cursor into the log, so every group sees every message while the
//! subscriptions inside one group compete for them. Unacknowledged deliveries
//! stay in flight until they are acked, nacked (or dropped, which counts as a
//! nack) and the log is compacted below the oldest offset any group still
//! needs.

use crate::transport::{
    Acknowledger, Delivery, StartFrom, Subscription, Transport, TransportError,
};
use async_trait::async_trait;
use courier_protocol::Envelope;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Maximum entries kept for a topic nobody subscribes to.
pub const DEFAULT_MAX_RETAINED: usize = 10_000;

#[derive(Debug)]
struct GroupState {
    /// Next never-delivered offset.
    cursor: u64,
    in_flight: BTreeSet<u64>,
    redeliver: VecDeque<u64>,
    attempts: HashMap<u64, u32>,
}

impl GroupState {
    fn new(cursor: u64) -> Self {
        Self {
            cursor,
            in_flight: BTreeSet::new(),
            redeliver: VecDeque::new(),
            attempts: HashMap::new(),
        }
    }

    /// Oldest offset this group may still need.
    fn low_watermark(&self) -> u64 {
        let in_flight = self.in_flight.first().copied().unwrap_or(u64::MAX);
        let queued = self.redeliver.iter().min().copied().unwrap_or(u64::MAX);
        self.cursor.min(in_flight).min(queued)
    }
}

#[derive(Debug, Default)]
struct TopicLog {
    /// Offset of `entries[0]`.
    base: u64,
    entries: VecDeque<Envelope>,
    groups: HashMap<String, GroupState>,
}

impl TopicLog {
    fn take(&mut self, group: &str) -> Option<(u64, Envelope, u32)> {
        let TopicLog {
            base,
            entries,
            groups,
        } = self;
        let state = groups.get_mut(group)?;
        let end = *base + entries.len() as u64;

        let offset = match state.redeliver.pop_front() {
            Some(offset) => offset,
            None if state.cursor < end => {
                state.cursor += 1;
                state.cursor - 1
            }
            None => return None,
        };

        let index = usize::try_from(offset.checked_sub(*base)?).ok()?;
        let envelope = entries.get(index)?.clone();

        let attempt = state.attempts.entry(offset).or_insert(0);
        *attempt += 1;
        state.in_flight.insert(offset);
        Some((offset, envelope, *attempt))
    }

    fn compact(&mut self) {
        let Some(low) = self.groups.values().map(GroupState::low_watermark).min() else {
            return;
        };
        while self.base < low && self.entries.pop_front().is_some() {
            self.base += 1;
        }
    }
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    max_retained: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, topic: &str, group: &str, offset: u64, requeue: bool) {
        let mut requeued = false;
        {
            let mut state = self.lock();
            let Some(log) = state.topics.get_mut(topic) else {
                return;
            };
            let Some(group_state) = log.groups.get_mut(group) else {
                return;
            };
            if !group_state.in_flight.remove(&offset) {
                return;
            }
            if requeue {
                group_state.redeliver.push_back(offset);
                requeued = true;
            } else {
                group_state.attempts.remove(&offset);
                log.compact();
            }
        }
        if requeued {
            trace!(topic, group, offset, "Envelope queued for redelivery");
            self.notify.notify_waiters();
        }
    }
}

/// In-process transport backed by per-topic logs.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create a transport with the default retention cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_retained(DEFAULT_MAX_RETAINED)
    }

    /// Create a transport keeping at most `max_retained` entries for topics
    /// without consumer groups.
    #[must_use]
    pub fn with_max_retained(max_retained: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                max_retained: max_retained.max(1),
            }),
        }
    }

    /// Number of entries currently retained for `topic`.
    #[must_use]
    pub fn retained(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map_or(0, |log| log.entries.len())
    }

    /// Number of deliveries of `topic` currently in flight in `group`.
    #[must_use]
    pub fn in_flight(&self, topic: &str, group: &str) -> usize {
        self.shared
            .lock()
            .topics
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .map_or(0, |g| g.in_flight.len())
    }

    /// Whether the transport has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), TransportError> {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            let log = state.topics.entry(topic.to_string()).or_default();
            trace!(topic, id = %envelope.id, offset = log.base + log.entries.len() as u64, "Appending envelope");
            log.entries.push_back(envelope);

            if log.groups.is_empty() && log.entries.len() > self.shared.max_retained {
                log.entries.pop_front();
                log.base += 1;
                warn!(topic, max_retained = self.shared.max_retained, "Topic has no consumer group, dropped oldest envelope");
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe_from(
        &self,
        topic: &str,
        group: &str,
        start: StartFrom,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            let log = state.topics.entry(topic.to_string()).or_default();
            let offset = match start {
                StartFrom::Earliest => log.base,
                StartFrom::Latest => log.base + log.entries.len() as u64,
            };
            let created = !log.groups.contains_key(group);
            log.groups
                .entry(group.to_string())
                .or_insert_with(|| GroupState::new(offset));
            if created {
                debug!(topic, group, offset, "Created consumer group");
                log.compact();
            }
        }

        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            topic: topic.to_string(),
            group: group.to_string(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
        debug!("Memory transport closed");
        Ok(())
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    topic: String,
    group: String,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Ok(None);
                }
                let taken = state
                    .topics
                    .get_mut(&self.topic)
                    .and_then(|log| log.take(&self.group));
                if let Some((offset, envelope, attempt)) = taken {
                    let acker = MemoryAcker {
                        shared: Arc::clone(&self.shared),
                        topic: self.topic.clone(),
                        group: self.group.clone(),
                        offset,
                        settled: AtomicBool::new(false),
                    };
                    return Ok(Some(Delivery::new(envelope, attempt, Box::new(acker))));
                }
            }

            notified.await;
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    topic: String,
    group: String,
    offset: u64,
    settled: AtomicBool,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        if !self.settled.swap(true, Ordering::AcqRel) {
            self.shared.settle(&self.topic, &self.group, self.offset, false);
        }
        Ok(())
    }

    async fn nack(&self) -> Result<(), TransportError> {
        if !self.settled.swap(true, Ordering::AcqRel) {
            self.shared.settle(&self.topic, &self.group, self.offset, true);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.settled.swap(true, Ordering::AcqRel) {
            self.shared.settle(&self.topic, &self.group, self.offset, true);
        }
    }
}

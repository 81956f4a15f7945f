//! Redis Streams transport.
//!
//! Topics are streams and consumer groups are Redis consumer groups. Each
//! envelope is stored in a single `envelope` field using the binary codec.
//! A subscription first drains entries already pending for its consumer
//! (left over from a crash or a nack) and then reads new ones. Streams are
//! trimmed approximately to a maximum length on every append.

use crate::transport::{
    Acknowledger, Delivery, StartFrom, Subscription, Transport, TransportError,
};
use async_trait::async_trait;
use courier_protocol::{codec, Envelope};
use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::streams::{StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};
use ::redis::{AsyncCommands, Client, RedisError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stream field holding the encoded envelope.
pub const ENVELOPE_FIELD: &str = "envelope";

/// `XREADGROUP` block time.
pub const BLOCK: Duration = Duration::from_secs(1);

/// Default approximate cap on entries per stream.
pub const DEFAULT_MAX_LEN: usize = 100_000;

/// Transport backed by Redis Streams.
pub struct RedisTransport {
    client: Client,
    conn: ConnectionManager,
    instance_id: String,
    max_len: usize,
    closed: Arc<AtomicBool>,
    consumers: Mutex<HashMap<String, u32>>,
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("instance_id", &self.instance_id)
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}

impl RedisTransport {
    /// Connect to `url`. `instance_id` names this process's consumers.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str, instance_id: impl Into<String>) -> Result<Self, TransportError> {
        let client = Client::open(url).map_err(connect_error)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(connect_error)?;
        let instance_id = instance_id.into();
        info!(instance = %instance_id, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            instance_id,
            max_len: DEFAULT_MAX_LEN,
            closed: Arc::new(AtomicBool::new(false)),
            consumers: Mutex::new(HashMap::new()),
        })
    }

    /// Trim each stream to roughly `max_len` entries on append.
    ///
    /// Entries trimmed before a group read them are lost to that group.
    #[must_use]
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    /// Next consumer name for `group`.
    ///
    /// Names are stable across restarts of the same instance, so a restarted
    /// process picks up the entries its predecessor left pending.
    fn consumer_name(&self, group: &str) -> String {
        let mut consumers = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let n = consumers.entry(group.to_string()).or_insert(0);
        let name = consumer_name(group, &self.instance_id, *n);
        *n += 1;
        name
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

fn consumer_name(group: &str, instance_id: &str, worker: u32) -> String {
    format!("{group}-{instance_id}-{worker}")
}

fn connect_error(e: RedisError) -> TransportError {
    TransportError::Connect {
        backend: "redis",
        reason: e.to_string(),
    }
}

/// Group creation id for `start`.
fn group_start_id(start: StartFrom) -> &'static str {
    match start {
        StartFrom::Earliest => "0",
        StartFrom::Latest => "$",
    }
}

fn is_busy_group(e: &RedisError) -> bool {
    e.code() == Some("BUSYGROUP")
}

fn decode_entry(entry: &StreamId) -> Result<Envelope, TransportError> {
    let value = entry
        .map
        .get(ENVELOPE_FIELD)
        .ok_or_else(|| TransportError::Receive(format!("entry {} has no envelope field", entry.id)))?;
    let bytes: Vec<u8> = ::redis::from_redis_value(value)
        .map_err(|e| TransportError::Receive(format!("entry {}: {e}", entry.id)))?;
    Ok(codec::decode(&bytes)?)
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.ensure_open()?;
        let encoded = codec::encode(&envelope)?;
        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd_maxlen(
                topic,
                StreamMaxlen::Approx(self.max_len),
                "*",
                &[(ENVELOPE_FIELD, encoded)],
            )
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe_from(
        &self,
        topic: &str,
        group: &str,
        start: StartFrom,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        self.ensure_open()?;
        let subscribe_error = |e: RedisError| TransportError::Subscribe {
            topic: topic.to_string(),
            group: group.to_string(),
            reason: e.to_string(),
        };

        let mut conn = self.conn.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(topic, group, group_start_id(start))
            .await
        {
            Ok(()) => debug!(topic, group, ?start, "Created consumer group"),
            Err(e) if is_busy_group(&e) => {}
            Err(e) => return Err(subscribe_error(e)),
        }

        // XREADGROUP blocks its connection, so every subscription gets its own.
        let reader = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(subscribe_error)?;
        let consumer = self.consumer_name(group);
        debug!(topic, group, consumer = %consumer, "Subscribed");

        Ok(Box::new(RedisSubscription {
            reader,
            acker: self.conn.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            consumer,
            closed: Arc::clone(&self.closed),
            read_backlog: Arc::new(AtomicBool::new(true)),
            attempts: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        info!("Redis transport closed");
        Ok(())
    }
}

struct RedisSubscription {
    reader: MultiplexedConnection,
    acker: ConnectionManager,
    topic: String,
    group: String,
    consumer: String,
    closed: Arc<AtomicBool>,
    read_backlog: Arc<AtomicBool>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

impl RedisSubscription {
    async fn read_one(&mut self, backlog: bool) -> Result<Option<StreamId>, TransportError> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);
        let (options, id) = if backlog {
            (options, "0")
        } else {
            (options.block(BLOCK.as_millis() as usize), ">")
        };

        let reply: Option<StreamReadReply> = self
            .reader
            .xread_options(&[&self.topic], &[id], &options)
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|key| key.ids.into_iter().next()))
    }

    fn record_attempt(&self, id: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let n = attempts.entry(id.to_string()).or_insert(0);
        *n += 1;
        *n
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }

            let backlog = self.read_backlog.load(Ordering::Acquire);
            let Some(entry) = self.read_one(backlog).await? else {
                if backlog {
                    self.read_backlog.store(false, Ordering::Release);
                }
                continue;
            };

            let envelope = match decode_entry(&entry) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(topic = %self.topic, id = %entry.id, error = %e, "Dropping undecodable entry");
                    let _: i64 = self
                        .acker
                        .xack(&self.topic, &self.group, &[&entry.id])
                        .await
                        .map_err(|e| TransportError::Ack(e.to_string()))?;
                    continue;
                }
            };

            let attempt = self.record_attempt(&entry.id);
            let acker = RedisAcker {
                conn: self.acker.clone(),
                topic: self.topic.clone(),
                group: self.group.clone(),
                id: entry.id,
                read_backlog: Arc::clone(&self.read_backlog),
                attempts: Arc::clone(&self.attempts),
                settled: AtomicBool::new(false),
            };
            return Ok(Some(Delivery::new(envelope, attempt, Box::new(acker))));
        }
    }
}

struct RedisAcker {
    conn: ConnectionManager,
    topic: String,
    group: String,
    id: String,
    read_backlog: Arc<AtomicBool>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
    settled: AtomicBool,
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.topic, &self.group, &[&self.id])
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))?;
        Ok(())
    }

    async fn nack(&self) -> Result<(), TransportError> {
        // The entry stays pending; re-reading the backlog picks it up again.
        self.settled.store(true, Ordering::Release);
        self.read_backlog.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for RedisAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::Acquire) {
            self.read_backlog.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::redis::Value;

    #[test]
    fn test_consumer_names_are_stable() {
        assert_eq!(consumer_name("svc", "pod-1", 0), "svc-pod-1-0");
        assert_eq!(consumer_name("svc.h", "pod-1", 3), "svc.h-pod-1-3");
    }

    #[test]
    fn test_broadcast_groups_start_at_stream_end() {
        assert_eq!(group_start_id(StartFrom::Earliest), "0");
        assert_eq!(group_start_id(StartFrom::Latest), "$");
    }

    #[test]
    fn test_decode_entry() {
        let envelope = Envelope::new("Ping", b"{}".to_vec());
        let encoded = codec::encode(&envelope).unwrap();
        let mut map = HashMap::new();
        map.insert(ENVELOPE_FIELD.to_string(), Value::Data(encoded));
        let entry = StreamId {
            id: "1-0".to_string(),
            map,
        };
        assert_eq!(decode_entry(&entry).unwrap(), envelope);
    }

    #[test]
    fn test_decode_entry_without_field() {
        let entry = StreamId {
            id: "1-0".to_string(),
            map: HashMap::new(),
        };
        assert!(matches!(decode_entry(&entry), Err(TransportError::Receive(_))));
    }
}

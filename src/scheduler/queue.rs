//! Redis Streams subscription for scheduler messages.
//!
//! The external scheduler publishes job messages to a stream (the "topic").
//! This service reads them through a consumer group (the "subscription"),
//! which gives at-least-once delivery:
//!
//! - `XREADGROUP` hands each new entry to exactly one consumer and records it
//!   in the group's pending entries list
//! - `XACK` removes it from the pending list once handled
//! - Entries left pending longer than the ack deadline are reclaimed with
//!   `XCLAIM` and delivered again
//!
//! # Stream Layout
//!
//! Each entry carries the raw message payload in a single `data` field.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingId, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, info};

use super::job::JobMessage;

/// Stream field holding the message payload.
const DATA_FIELD: &str = "data";

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize message data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// A message handed to the consumer by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned message id, used to acknowledge.
    pub id: String,
    /// Raw payload as published.
    pub data: Vec<u8>,
    /// How many times this message has been delivered, this one included.
    pub delivery_count: u64,
}

impl Delivery {
    /// Creates a first-time delivery.
    pub fn new(id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
            delivery_count: 1,
        }
    }
}

/// A durable subscription the consumption loop pulls messages from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for the next batch of deliveries.
    ///
    /// An empty batch means nothing arrived within the poll window.
    async fn receive(&self) -> Result<Vec<Delivery>, QueueError>;

    /// Acknowledges a delivery so the broker stops redelivering it.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

/// Configuration for a stream subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Stream the scheduler publishes to.
    pub topic: String,
    /// Consumer group name shared by every replica of this service.
    pub subscription: String,
    /// Name of this consumer within the group.
    pub consumer: String,
    /// Maximum messages fetched per receive.
    pub batch_size: usize,
    /// How long a receive blocks waiting for new messages.
    pub poll_interval: Duration,
    /// How long a delivered message may stay unacknowledged before redelivery.
    pub ack_deadline: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            topic: "cron".to_string(),
            subscription: "cron-client".to_string(),
            consumer: "cron-runner".to_string(),
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            ack_deadline: Duration::from_secs(60),
        }
    }
}

impl SubscriptionConfig {
    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the topic (stream key).
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Sets the subscription (consumer group).
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = subscription.into();
        self
    }

    /// Sets the consumer name.
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Sets the receive batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the ack deadline.
    pub fn with_ack_deadline(mut self, deadline: Duration) -> Self {
        self.ack_deadline = deadline;
        self
    }
}

/// Consumer-group subscription on a Redis stream.
pub struct StreamSubscription {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    config: SubscriptionConfig,
}

impl StreamSubscription {
    /// Connects to Redis and subscribes to the configured topic.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(config: SubscriptionConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let subscription = Self::from_connection(redis, config);
        subscription.subscribe().await;
        Ok(subscription)
    }

    /// Creates a subscription from an existing ConnectionManager.
    ///
    /// Does not touch the consumer group; call [`subscribe`](Self::subscribe).
    pub fn from_connection(redis: ConnectionManager, config: SubscriptionConfig) -> Self {
        Self { redis, config }
    }

    /// Creates the consumer group, or attaches to it if that fails.
    ///
    /// Creation fails with `BUSYGROUP` when the group already exists, which
    /// is the normal case after the first start. Any failure falls back to
    /// the existing group of the same name; a group that truly does not exist
    /// surfaces later as a receive error.
    pub async fn subscribe(&self) {
        let mut conn = self.redis.clone();
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.config.topic, &self.config.subscription, "$")
            .await;

        match created {
            Ok(()) => info!(
                topic = %self.config.topic,
                subscription = %self.config.subscription,
                "Created subscription"
            ),
            Err(e) => info!(
                topic = %self.config.topic,
                subscription = %self.config.subscription,
                error = %e,
                "Could not create subscription, attaching to existing one"
            ),
        }
    }

    /// Reclaims messages whose ack deadline has passed.
    ///
    /// The server selects by idle time, so entries that keep coming back
    /// (undecodable payloads) cannot crowd older expired entries out of the
    /// window. Requires Redis 6.2 or newer.
    async fn reclaim_expired(&self) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.redis.clone();
        let deadline_ms = self.config.ack_deadline.as_millis() as usize;

        let pending: StreamPendingCountReply = pending_idle_cmd(
            &self.config.topic,
            &self.config.subscription,
            deadline_ms,
            self.config.batch_size,
        )
        .query_async(&mut conn)
        .await?;

        let expired = expired_entries(&pending.ids, deadline_ms);
        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = expired.iter().map(|(id, _)| id.as_str()).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.config.topic,
                &self.config.subscription,
                &self.config.consumer,
                deadline_ms,
                &ids,
            )
            .await?;

        let deliveries: Vec<Delivery> = claimed
            .ids
            .iter()
            .map(|entry| {
                let previous = expired
                    .iter()
                    .find(|(id, _)| *id == entry.id)
                    .map(|(_, times)| *times as u64)
                    .unwrap_or(1);
                let mut delivery = delivery_from_entry(entry);
                delivery.delivery_count = previous + 1;
                delivery
            })
            .collect();

        if !deliveries.is_empty() {
            info!(
                count = deliveries.len(),
                subscription = %self.config.subscription,
                "Redelivering messages past their ack deadline"
            );
        }

        Ok(deliveries)
    }

    /// Reads messages never delivered to any consumer of the group.
    async fn read_new(&self) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.redis.clone();
        let options = StreamReadOptions::default()
            .group(&self.config.subscription, &self.config.consumer)
            .count(self.config.batch_size)
            .block(self.config.poll_interval.as_millis() as usize);

        // Nil when the block window elapses with nothing new.
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.topic], &[">"], &options)
            .await?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .iter()
                    .flat_map(|key| key.ids.iter().map(delivery_from_entry))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Returns the subscription configuration.
    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }
}

#[async_trait]
impl MessageSource for StreamSubscription {
    async fn receive(&self) -> Result<Vec<Delivery>, QueueError> {
        let redelivered = self.reclaim_expired().await?;
        if !redelivered.is_empty() {
            return Ok(redelivered);
        }

        let deliveries = self.read_new().await?;
        debug!(count = deliveries.len(), "Received messages");
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let _acked: usize = conn
            .xack(&self.config.topic, &self.config.subscription, &[&delivery.id])
            .await?;
        Ok(())
    }
}

/// Publishes job messages to a topic, the way the external scheduler does.
pub struct StreamPublisher {
    redis: ConnectionManager,
    topic: String,
}

impl StreamPublisher {
    /// Connects to Redis for publishing to `topic`.
    pub async fn connect(redis_url: &str, topic: &str) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            redis,
            topic: topic.to_string(),
        })
    }

    /// Publishes a message and returns its broker id.
    pub async fn publish(&self, message: &JobMessage) -> Result<String, QueueError> {
        let payload = message.encode()?;
        let mut conn = self.redis.clone();
        let id: String = conn
            .xadd(&self.topic, "*", &[(DATA_FIELD, payload)])
            .await?;
        Ok(id)
    }
}

/// `XPENDING <topic> <group> IDLE <min_idle_ms> - + <count>`: the oldest
/// pending entries that have been idle for at least `min_idle_ms`.
fn pending_idle_cmd(topic: &str, group: &str, min_idle_ms: usize, count: usize) -> redis::Cmd {
    let mut cmd = redis::cmd("XPENDING");
    cmd.arg(topic)
        .arg(group)
        .arg("IDLE")
        .arg(min_idle_ms)
        .arg("-")
        .arg("+")
        .arg(count);
    cmd
}

/// Ids and delivery counts of the pending entries idle past the deadline.
fn expired_entries(pending: &[StreamPendingId], deadline_ms: usize) -> Vec<(String, usize)> {
    pending
        .iter()
        .filter(|p| p.last_delivered_ms >= deadline_ms)
        .map(|p| (p.id.clone(), p.times_delivered))
        .collect()
}

/// Builds a delivery from a stream entry.
///
/// An entry without a `data` field yields an empty payload, which the
/// consumer then fails to decode.
fn delivery_from_entry(entry: &StreamId) -> Delivery {
    let data: Vec<u8> = entry.get(DATA_FIELD).unwrap_or_default();
    Delivery::new(entry.id.clone(), data)
}

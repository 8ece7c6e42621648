//! Job queue implementation using Redis Streams
//!
//! Layout, with the default prefix:
//!
//! - `recommdo:jobs:high`: analysis jobs
//! - `recommdo:jobs:normal`: import jobs
//! - `recommdo:jobs:dlq`: jobs that exhausted their attempts or failed terminally
//!
//! Every entry carries the JSON job in its `payload` field. Workers read
//! through one consumer group, so an entry stays pending until acknowledged
//! and entries abandoned by a crashed worker can be reclaimed. A worker
//! touches its delivery while the job runs, which keeps the entry's idle time
//! below the reclaim threshold.
//!
//! Acknowledged entries are deleted, so a lane only holds jobs that are
//! waiting or in flight. The dead-letter stream is capped at roughly
//! [`DEAD_LETTER_MAXLEN`] entries.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use recommdo_core::RedisConfig;
use redis::{
    aio::MultiplexedConnection,
    streams::{
        StreamClaimOptions, StreamClaimReply, StreamMaxlen, StreamPendingCountReply,
        StreamPendingReply, StreamReadOptions, StreamReadReply,
    },
    AsyncCommands, Client,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::{JobPayload, Priority};

/// Approximate cap on the dead-letter stream
pub const DEAD_LETTER_MAXLEN: usize = 10_000;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed queue entry {0}: missing payload")]
    MissingPayload(String),
}

/// A job handed to a worker, to be acknowledged once handled
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub priority: Priority,
    pub job: JobPayload,
}

/// Queue depth
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// High priority jobs not yet delivered
    pub high: u64,
    /// Normal priority jobs not yet delivered
    pub normal: u64,
    /// Delivered but not yet acknowledged, across both lanes
    pub in_flight: u64,
    pub dead_letter: u64,
}

/// Job queue trait
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job; returns its message id
    async fn enqueue(&self, job: &JobPayload, priority: Priority) -> Result<String, QueueError>;

    /// Next job for this consumer, high priority first
    async fn dequeue(&self, consumer: &str) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a handled delivery and drop it from its lane
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Reset the idle time of a delivery that `consumer` is still working on
    async fn touch(&self, delivery: &Delivery, consumer: &str) -> Result<(), QueueError>;

    /// Move to the dead-letter stream and acknowledge
    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError>;

    /// Take over deliveries that any consumer left unacknowledged for
    /// longer than `min_idle`
    async fn reclaim(&self, consumer: &str, min_idle: Duration) -> Result<Vec<Delivery>, QueueError>;

    /// Get queue statistics
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Dead-letter entry
#[derive(Debug, Serialize)]
struct DeadLetter<'a> {
    job: &'a JobPayload,
    priority: Priority,
    error: &'a str,
    failed_at: chrono::DateTime<Utc>,
}

/// Redis Streams job queue
pub struct RedisJobQueue {
    client: Client,
    prefix: String,
    consumer_group: String,
    block: Duration,
}

impl RedisJobQueue {
    /// Open the client and make sure both lanes and the consumer group exist
    pub async fn connect(config: &RedisConfig) -> Result<Self, QueueError> {
        let client = Client::open(config.url.as_str())?;
        let queue = Self {
            client,
            prefix: config.queue_prefix.clone(),
            consumer_group: config.consumer_group.clone(),
            block: Duration::from_millis(1000),
        };

        for priority in [Priority::High, Priority::Normal] {
            queue.ensure_consumer_group(priority).await?;
        }

        Ok(queue)
    }

    /// How long an empty `dequeue` waits for new entries
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    async fn conn(&self) -> Result<MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn ensure_consumer_group(&self, priority: Priority) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;

        // BUSYGROUP just means the group already exists
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(self.stream_key(priority), &self.consumer_group, "0")
            .await;
        if let Err(e) = created {
            if e.code() != Some("BUSYGROUP") {
                return Err(e.into());
            }
        }

        Ok(())
    }

    fn stream_key(&self, priority: Priority) -> String {
        format!("{}:{}", self.prefix, priority.as_str())
    }

    fn dlq_key(&self) -> String {
        format!("{}:dlq", self.prefix)
    }

    fn parse_entry(
        priority: Priority,
        entry: &redis::streams::StreamId,
    ) -> Result<Delivery, QueueError> {
        let payload: String = entry
            .get("payload")
            .ok_or_else(|| QueueError::MissingPayload(entry.id.clone()))?;
        let job: JobPayload = serde_json::from_str(&payload)?;

        Ok(Delivery {
            message_id: entry.id.clone(),
            priority,
            job,
        })
    }

    async fn read_lane(
        &self,
        conn: &mut MultiplexedConnection,
        priority: Priority,
        consumer: &str,
        block: Option<Duration>,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut opts = StreamReadOptions::default()
            .group(&self.consumer_group, consumer)
            .count(1);
        if let Some(block) = block {
            opts = opts.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[self.stream_key(priority)], &[">"], &opts)
            .await?;

        let Some(entry) = reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next())
        else {
            return Ok(None);
        };

        Self::parse_entry(priority, &entry).map(Some)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &JobPayload, priority: Priority) -> Result<String, QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(job)?;

        let message_id: String = conn
            .xadd(self.stream_key(priority), "*", &[("payload", payload)])
            .await?;

        debug!(
            message_id = %message_id,
            priority = priority.as_str(),
            project_id = %job.project.id,
            attempt = job.attempt,
            "Job enqueued"
        );
        Ok(message_id)
    }

    async fn dequeue(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn().await?;

        if let Some(delivery) = self
            .read_lane(&mut conn, Priority::High, consumer, None)
            .await?
        {
            return Ok(Some(delivery));
        }

        self.read_lane(&mut conn, Priority::Normal, consumer, Some(self.block))
            .await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let key = self.stream_key(delivery.priority);

        let _: i64 = conn
            .xack(&key, &self.consumer_group, &[&delivery.message_id])
            .await?;
        let _: i64 = conn.xdel(&key, &[&delivery.message_id]).await?;
        Ok(())
    }

    async fn touch(&self, delivery: &Delivery, consumer: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;

        // Claiming our own entry with JUSTID resets its idle time only
        let _: Vec<String> = conn
            .xclaim_options(
                self.stream_key(delivery.priority),
                &self.consumer_group,
                consumer,
                0,
                &[&delivery.message_id],
                StreamClaimOptions::default().with_justid(),
            )
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let entry = DeadLetter {
            job: &delivery.job,
            priority: delivery.priority,
            error,
            failed_at: Utc::now(),
        };
        let payload = serde_json::to_string(&entry)?;

        let _: String = conn
            .xadd_maxlen(
                self.dlq_key(),
                StreamMaxlen::Approx(DEAD_LETTER_MAXLEN),
                "*",
                &[("payload", payload)],
            )
            .await?;

        self.ack(delivery).await
    }

    async fn reclaim(&self, consumer: &str, min_idle: Duration) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.conn().await?;
        let min_idle_ms = min_idle.as_millis() as usize;
        let mut recovered = Vec::new();

        for priority in [Priority::High, Priority::Normal] {
            let key = self.stream_key(priority);

            let pending: StreamPendingCountReply = conn
                .xpending_count(&key, &self.consumer_group, "-", "+", 100)
                .await?;

            let stale: Vec<String> = pending
                .ids
                .into_iter()
                .filter(|p| p.last_delivered_ms >= min_idle_ms)
                .map(|p| p.id)
                .collect();
            if stale.is_empty() {
                continue;
            }

            let claimed: StreamClaimReply = conn
                .xclaim(&key, &self.consumer_group, consumer, min_idle_ms, &stale)
                .await?;

            for entry in claimed.ids {
                match Self::parse_entry(priority, &entry) {
                    Ok(delivery) => recovered.push(delivery),
                    Err(e) => {
                        warn!(message_id = %entry.id, error = %e, "Dropping unreadable queue entry");
                        let _: i64 = conn
                            .xack(&key, &self.consumer_group, &[&entry.id])
                            .await?;
                        let _: i64 = conn.xdel(&key, &[&entry.id]).await?;
                    }
                }
            }
        }

        Ok(recovered)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn().await?;
        let mut stats = QueueStats {
            dead_letter: conn.xlen(self.dlq_key()).await?,
            ..QueueStats::default()
        };

        for priority in [Priority::High, Priority::Normal] {
            let key = self.stream_key(priority);
            let entries: u64 = conn.xlen(&key).await?;
            let pending: StreamPendingReply = conn.xpending(&key, &self.consumer_group).await?;
            let in_flight = match pending {
                StreamPendingReply::Data(data) => data.count as u64,
                StreamPendingReply::Empty => 0,
            };

            // Acknowledged entries are deleted, so the rest are waiting
            let waiting = entries.saturating_sub(in_flight);
            match priority {
                Priority::High => stats.high = waiting,
                Priority::Normal => stats.normal = waiting,
            }
            stats.in_flight += in_flight;
        }

        Ok(stats)
    }
}

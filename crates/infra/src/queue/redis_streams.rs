//! Redis Streams-backed task queue (durable, at-least-once, competing
//! consumers).
//!
//! ## Layout
//!
//! - **Stream** `docbatch:tasks`: one entry per task message, fields
//!   `payload` (JSON [`TaskMessage`]) and `deliveries`.
//! - **Consumer group** `docbatch-workers`: every worker process joins it
//!   with its own consumer name, so each entry goes to one consumer.
//! - **Delayed set** `docbatch:tasks:delayed`: retry messages scored by
//!   their due time (unix millis). Consumers move due members onto the
//!   stream before reading; `ZREM` decides which consumer moves a member.
//!
//! `ack` is `XACK` + `XDEL`. `nack` re-adds the payload with a bumped
//! delivery count and then acks the original. Entries left pending by a
//! dead consumer are taken over with `XAUTOCLAIM` once idle for
//! `claim_idle`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, instrument, warn};

use docbatch_events::{Delivery, DeliveryTag, QueueError, TaskMessage, TaskQueue};

const DEFAULT_STREAM_KEY: &str = "docbatch:tasks";
const DEFAULT_GROUP: &str = "docbatch-workers";
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

/// Due delayed messages moved onto the stream per `consume` call.
const PROMOTE_BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct RedisStreamsTaskQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    delayed_key: String,
    group: String,
    consumer: String,
    claim_idle: Duration,
}

impl RedisStreamsTaskQueue {
    /// Connect to `redis_url` and join the consumer group as `consumer`.
    ///
    /// Creates the stream and the group when missing.
    pub fn new(redis_url: impl AsRef<str>, consumer: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(unavailable)?;
        let queue = Self {
            client: Arc::new(client),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            delayed_key: format!("{DEFAULT_STREAM_KEY}:delayed"),
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.into(),
            claim_idle: DEFAULT_CLAIM_IDLE,
        };
        queue.ensure_group()?;
        Ok(queue)
    }

    /// Use a different stream (and delayed set) key. Tests use this to
    /// isolate runs.
    pub fn with_stream_key(mut self, stream_key: impl Into<String>) -> Result<Self, QueueError> {
        self.stream_key = stream_key.into();
        self.delayed_key = format!("{}:delayed", self.stream_key);
        self.ensure_group()?;
        Ok(self)
    }

    /// How long a delivery may stay unacked before another consumer takes
    /// it over.
    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client.get_connection().map_err(unavailable)
    }

    fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }

    fn add(
        &self,
        conn: &mut redis::Connection,
        payload: &str,
        deliveries: u32,
    ) -> Result<String, QueueError> {
        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("payload")
            .arg(payload)
            .arg("deliveries")
            .arg(deliveries)
            .query(conn)
            .map_err(|e| command("XADD", e))
    }

    /// Move due delayed messages onto the stream.
    fn promote_due(&self, conn: &mut redis::Connection) -> Result<usize, QueueError> {
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query(conn)
            .map_err(|e| command("ZRANGEBYSCORE", e))?;

        let mut promoted = 0;
        for payload in due {
            // Only the consumer whose ZREM succeeds publishes the message.
            let removed: u64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&payload)
                .query(conn)
                .map_err(|e| command("ZREM", e))?;
            if removed == 1 {
                self.add(conn, &payload, 0)?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Take over one entry another consumer left pending for too long.
    fn claim_stale(&self, conn: &mut redis::Connection) -> Result<Option<Delivery>, QueueError> {
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query(conn)
            .map_err(|e| command("XAUTOCLAIM", e))?;

        // [next-start, [entry...], (deleted ids)]
        let entries = match reply {
            redis::Value::Bulk(parts) => parts.into_iter().nth(1),
            _ => None,
        };
        let Some(redis::Value::Bulk(entries)) = entries else {
            return Ok(None);
        };

        for entry in entries {
            match parse_entry(entry) {
                Ok(mut delivery) => {
                    delivery.delivery_count += 1;
                    warn!(tag = %delivery.tag, job_id = %delivery.task.job_id, "claimed stale delivery");
                    return Ok(Some(delivery));
                }
                // Trimmed entries come back as nil; skip them.
                Err(e) => debug!(error = %e, "skipping unreadable claimed entry"),
            }
        }
        Ok(None)
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(timeout.as_millis().max(1) as u64)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| command("XREADGROUP", e))?;

        // Nil on timeout, else [[stream-key, [entry...]]]
        let redis::Value::Bulk(streams) = reply else {
            return Ok(None);
        };
        for stream in streams {
            let redis::Value::Bulk(mut parts) = stream else {
                continue;
            };
            if parts.len() < 2 {
                continue;
            }
            if let redis::Value::Bulk(entries) = parts.swap_remove(1) {
                if let Some(entry) = entries.into_iter().next() {
                    let mut delivery = parse_entry(entry)?;
                    delivery.delivery_count += 1;
                    return Ok(Some(delivery));
                }
            }
        }
        Ok(None)
    }

    fn remove(&self, conn: &mut redis::Connection, tag: &DeliveryTag) -> Result<(), QueueError> {
        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&tag.0)
            .query(conn)
            .map_err(|e| command("XACK", e))?;
        if acked == 0 {
            return Err(QueueError::UnknownDelivery(tag.clone()));
        }
        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(&tag.0)
            .query(conn)
            .map_err(|e| command("XDEL", e))?;
        Ok(())
    }
}

impl TaskQueue for RedisStreamsTaskQueue {
    #[instrument(skip(self, task), fields(job_id = %task.job_id, file = %task.filename, attempt = task.attempt), err)]
    fn enqueue(&self, task: TaskMessage) -> Result<(), QueueError> {
        let payload = encode(&task)?;
        let mut conn = self.connection()?;
        self.add(&mut conn, &payload, 0)?;
        Ok(())
    }

    fn enqueue_after(&self, task: TaskMessage, delay: Duration) -> Result<(), QueueError> {
        if delay.is_zero() {
            return self.enqueue(task);
        }
        let payload = encode(&task)?;
        let due = now_millis() + delay.as_millis() as u64;
        let mut conn = self.connection()?;
        let _: u64 = redis::cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(due)
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| command("ZADD", e))?;
        Ok(())
    }

    fn consume(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection()?;
        self.promote_due(&mut conn)?;
        if let Some(delivery) = self.claim_stale(&mut conn)? {
            return Ok(Some(delivery));
        }
        self.read_new(&mut conn, timeout)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        self.remove(&mut conn, &delivery.tag)
    }

    fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let payload = encode(&delivery.task)?;
        let mut conn = self.connection()?;
        // Re-add first: a crash in between duplicates, never loses.
        self.add(&mut conn, &payload, delivery.delivery_count)?;
        self.remove(&mut conn, &delivery.tag)
    }
}

fn encode(task: &TaskMessage) -> Result<String, QueueError> {
    serde_json::to_string(task).map_err(|e| QueueError::Serialization(e.to_string()))
}

/// Parse `[id, [field, value, ...]]` into a delivery. The returned
/// `delivery_count` is the count stored on the entry, before this read.
fn parse_entry(entry: redis::Value) -> Result<Delivery, QueueError> {
    let redis::Value::Bulk(mut parts) = entry else {
        return Err(malformed("entry is not an array"));
    };
    if parts.len() < 2 {
        return Err(malformed("entry too short"));
    }
    let redis::Value::Bulk(raw_fields) = parts.swap_remove(1) else {
        return Err(malformed("fields are not an array"));
    };
    let redis::Value::Data(id) = &parts[0] else {
        return Err(malformed("missing entry id"));
    };
    let tag = DeliveryTag(String::from_utf8_lossy(id).into_owned());

    let mut fields = HashMap::new();
    for pair in raw_fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = pair {
            fields.insert(
                String::from_utf8_lossy(key).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            );
        }
    }

    let payload = fields
        .get("payload")
        .ok_or_else(|| malformed("missing payload field"))?;
    let task: TaskMessage =
        serde_json::from_str(payload).map_err(|e| QueueError::Serialization(e.to_string()))?;
    let delivery_count = fields
        .get("deliveries")
        .and_then(|d| d.parse().ok())
        .unwrap_or(0);

    Ok(Delivery {
        tag,
        task,
        delivery_count,
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn unavailable(e: redis::RedisError) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

fn command(name: &str, e: redis::RedisError) -> QueueError {
    QueueError::Unavailable(format!("{name} failed: {e}"))
}

fn malformed(reason: &str) -> QueueError {
    QueueError::Serialization(format!("malformed stream entry: {reason}"))
}

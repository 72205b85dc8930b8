//! Redis Streams-backed task queue (durable, at-least-once delivery).
//!
//! This implementation uses Redis Streams with a single consumer group:
//! - **Durable**: entries persist in the stream; delivered-but-unacked entries
//!   stay in the group's pending list across process restarts
//! - **At-least-once**: an entry idle longer than the visibility timeout is
//!   reclaimed with `XAUTOCLAIM` and handed to whichever consumer asks next
//! - **Dead-letter**: entries that cannot be decoded go to `{stream}:dlq`
//!
//! ## Architecture
//!
//! - **Stream Key**: `atelier:generation` (one stream for all generation tasks)
//! - **Consumer Group**: `generation-workers`
//! - **Consumers**: one per worker task, e.g. `generation-0`, `generation-1`
//! - **Entry fields**: `job_id`, `owner_kind`, `task` (JSON [`Task`])

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, instrument, warn};

use atelier_queue::{Delivery, QueueError, Task, TaskHandle, TaskQueue};

/// Default stream key for generation tasks
pub const DEFAULT_STREAM_KEY: &str = "atelier:generation";

/// Default consumer group
pub const DEFAULT_GROUP: &str = "generation-workers";

/// How long one `XREADGROUP` call blocks waiting for new entries.
const DEFAULT_BLOCK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisQueueConfig {
    pub redis_url: String,
    pub stream_key: String,
    pub group: String,
    /// Idle time after which an unacked entry is reclaimed.
    pub visibility_timeout: Duration,
    pub block: Duration,
}

impl RedisQueueConfig {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            visibility_timeout: Duration::from_secs(300),
            block: DEFAULT_BLOCK,
        }
    }

    pub fn dlq_key(&self) -> String {
        format!("{}:dlq", self.stream_key)
    }
}

/// Redis Streams [`TaskQueue`].
///
/// Writes share one multiplexed connection. Each consumer gets its own
/// connection for `XREADGROUP ... BLOCK` so a blocked read never stalls
/// enqueues or acks.
pub struct RedisStreamsTaskQueue {
    client: Arc<redis::Client>,
    config: RedisQueueConfig,
    writer: OnceCell<MultiplexedConnection>,
    readers: Mutex<HashMap<String, MultiplexedConnection>>,
    autoclaim_cursor: Mutex<String>,
}

impl std::fmt::Debug for RedisStreamsTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsTaskQueue")
            .field("stream_key", &self.config.stream_key)
            .field("group", &self.config.group)
            .finish()
    }
}

impl RedisStreamsTaskQueue {
    /// Open a client and make sure the consumer group exists.
    pub async fn connect(config: RedisQueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let queue = Self {
            client: Arc::new(client),
            config,
            writer: OnceCell::new(),
            readers: Mutex::new(HashMap::new()),
            autoclaim_cursor: Mutex::new("0-0".to_string()),
        };
        queue.ensure_consumer_group().await?;
        Ok(queue)
    }

    pub fn config(&self) -> &RedisQueueConfig {
        &self.config
    }

    /// Ensure the consumer group exists (idempotent).
    ///
    /// `MKSTREAM` creates the stream too. Starting at `0` means a freshly
    /// created group also sees entries written before it existed.
    pub async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.writer().await?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => {
                debug!(stream_key = %self.config.stream_key, group = %self.config.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error("XGROUP CREATE", e)),
        }
    }

    async fn writer(&self) -> Result<MultiplexedConnection, QueueError> {
        self.writer
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_tokio_connection()
                    .await
                    .map_err(|e| QueueError::Unavailable(e.to_string()))
            })
            .await
            .cloned()
    }

    async fn reader(&self, consumer: &str) -> Result<MultiplexedConnection, QueueError> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(consumer) {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        readers.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    async fn drop_reader(&self, consumer: &str) {
        self.readers.lock().await.remove(consumer);
    }

    /// Take over one entry that has been idle past the visibility timeout.
    async fn reclaim(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.writer().await?;
        let mut cursor = self.autoclaim_cursor.lock().await;

        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(consumer)
            .arg(self.config.visibility_timeout.as_millis() as u64)
            .arg(cursor.as_str())
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XAUTOCLAIM", e))?;

        let (next_cursor, entries) = parse_autoclaim_reply(reply)?;
        *cursor = next_cursor;
        drop(cursor);

        let Some(entry) = entries.into_iter().next() else {
            return Ok(None);
        };

        let delivery_count = self.delivery_count(&mut conn, &entry.id).await?;
        warn!(
            message_id = %entry.id,
            consumer = %consumer,
            delivery_count,
            "reclaimed idle task"
        );
        self.decode_delivery(entry, delivery_count).await
    }

    async fn delivery_count(&self, conn: &mut MultiplexedConnection, id: &str) -> Result<u32, QueueError> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| map_redis_error("XPENDING", e))?;

        Ok(pending
            .first()
            .map(|(_, _, _, count)| u32::try_from(*count).unwrap_or(u32::MAX))
            .unwrap_or(1))
    }

    async fn read_new(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.reader(consumer).await?;

        let reply: redis::RedisResult<redis::Value> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.config.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await;

        let reply = match reply {
            Ok(value) => value,
            Err(e) if e.code() == Some("NOGROUP") => {
                warn!(group = %self.config.group, "consumer group missing, recreating");
                self.ensure_consumer_group().await?;
                return Ok(None);
            }
            Err(e) => {
                self.drop_reader(consumer).await;
                return Err(map_redis_error("XREADGROUP", e));
            }
        };

        match parse_read_reply(reply, &self.config.stream_key)?.into_iter().next() {
            Some(entry) => self.decode_delivery(entry, 1).await,
            None => Ok(None),
        }
    }

    /// Decode an entry, dead-lettering it if it is not a valid task.
    async fn decode_delivery(&self, entry: RawEntry, delivery_count: u32) -> Result<Option<Delivery>, QueueError> {
        match decode_task(&entry) {
            Ok(task) => Ok(Some(Delivery {
                handle: TaskHandle::new(entry.id),
                task,
                delivery_count,
            })),
            Err(reason) => {
                self.dead_letter(&entry, &reason.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn dead_letter(&self, entry: &RawEntry, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.writer().await?;
        let raw = entry.fields.get("task").cloned().unwrap_or_default();

        let _: String = redis::cmd("XADD")
            .arg(self.config.dlq_key())
            .arg("*")
            .arg("original_message_id")
            .arg(&entry.id)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("task")
            .arg(raw)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("DLQ XADD", e))?;

        self.xack(&mut conn, &entry.id).await?;

        error!(
            message_id = %entry.id,
            reason = %reason,
            "undecodable task sent to dead-letter queue"
        );
        Ok(())
    }

    async fn xack(&self, conn: &mut MultiplexedConnection, id: &str) -> Result<(), QueueError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(id)
            .query_async(conn)
            .await
            .map_err(|e| map_redis_error("XACK", e))?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisStreamsTaskQueue {
    #[instrument(
        skip(self, task),
        fields(stream_key = %self.config.stream_key, job_id = %task.job_id),
        err
    )]
    async fn enqueue(&self, task: &Task) -> Result<TaskHandle, QueueError> {
        let payload = task.to_json()?;
        let mut conn = self.writer().await?;

        let id: String = redis::cmd("XADD")
            .arg(&self.config.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(task.job_id.to_string())
            .arg("owner_kind")
            .arg(task.owner.kind().as_str())
            .arg("task")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XADD", e))?;

        Ok(TaskHandle::new(id))
    }

    async fn dequeue(&self, consumer: &str) -> Result<Delivery, QueueError> {
        loop {
            if let Some(delivery) = self.reclaim(consumer).await? {
                return Ok(delivery);
            }
            if let Some(delivery) = self.read_new(consumer).await? {
                return Ok(delivery);
            }
        }
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.handle), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.writer().await?;
        self.xack(&mut conn, delivery.handle.as_str()).await
    }
}

/// Stream entry as read from Redis, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawEntry {
    id: String,
    fields: HashMap<String, String>,
}

fn map_redis_error(command: &str, err: redis::RedisError) -> QueueError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        QueueError::Unavailable(format!("{command}: {err}"))
    } else {
        QueueError::Command(format!("{command} failed: {err}"))
    }
}

fn bad_reply(what: &str) -> QueueError {
    QueueError::Deserialization(format!("unexpected reply shape: {what}"))
}

fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(data) => Some(String::from_utf8_lossy(data).to_string()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse one entry: `[id, [field1, value1, field2, value2, ...]]`.
///
/// Entries deleted from the stream while pending come back as nil.
fn parse_stream_entry(entry: redis::Value) -> Result<Option<RawEntry>, QueueError> {
    let parts = match entry {
        redis::Value::Nil => return Ok(None),
        redis::Value::Bulk(parts) => parts,
        _ => return Err(bad_reply("entry is not an array")),
    };
    if parts.len() < 2 {
        return Err(bad_reply("entry too short"));
    }

    let id = value_to_string(&parts[0]).ok_or_else(|| bad_reply("entry id"))?;
    let raw_fields = match &parts[1] {
        redis::Value::Bulk(v) => v,
        // Deleted entry: id without fields.
        redis::Value::Nil => return Ok(None),
        _ => return Err(bad_reply("entry fields")),
    };

    let mut fields = HashMap::new();
    for chunk in raw_fields.chunks(2) {
        if let [key, value] = chunk {
            if let (Some(key), Some(value)) = (value_to_string(key), value_to_string(value)) {
                fields.insert(key, value);
            }
        }
    }

    Ok(Some(RawEntry { id, fields }))
}

/// `XREADGROUP` reply: nil on timeout, else `[[stream_key, [entry, ...]], ...]`.
fn parse_read_reply(reply: redis::Value, stream_key: &str) -> Result<Vec<RawEntry>, QueueError> {
    let streams = match reply {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Bulk(streams) => streams,
        _ => return Err(bad_reply("XREADGROUP reply")),
    };

    let mut out = Vec::new();
    for stream in streams {
        let redis::Value::Bulk(pair) = stream else {
            return Err(bad_reply("XREADGROUP stream"));
        };
        let mut pair = pair.into_iter();
        let key = pair.next().as_ref().and_then(value_to_string);
        if key.as_deref() != Some(stream_key) {
            continue;
        }
        match pair.next() {
            Some(redis::Value::Bulk(entries)) => {
                for entry in entries {
                    if let Some(entry) = parse_stream_entry(entry)? {
                        out.push(entry);
                    }
                }
            }
            Some(redis::Value::Nil) | None => {}
            Some(_) => return Err(bad_reply("XREADGROUP entries")),
        }
    }
    Ok(out)
}

/// `XAUTOCLAIM` reply: `[next_cursor, [entry, ...], (deleted ids)]`.
fn parse_autoclaim_reply(reply: redis::Value) -> Result<(String, Vec<RawEntry>), QueueError> {
    let redis::Value::Bulk(parts) = reply else {
        return Err(bad_reply("XAUTOCLAIM reply"));
    };
    let mut parts = parts.into_iter();
    let cursor = parts
        .next()
        .as_ref()
        .and_then(value_to_string)
        .ok_or_else(|| bad_reply("XAUTOCLAIM cursor"))?;

    let mut entries = Vec::new();
    match parts.next() {
        Some(redis::Value::Bulk(claimed)) => {
            for entry in claimed {
                if let Some(entry) = parse_stream_entry(entry)? {
                    entries.push(entry);
                }
            }
        }
        Some(redis::Value::Nil) | None => {}
        Some(_) => return Err(bad_reply("XAUTOCLAIM entries")),
    }
    Ok((cursor, entries))
}

fn decode_task(entry: &RawEntry) -> Result<Task, QueueError> {
    let raw = entry
        .fields
        .get("task")
        .ok_or_else(|| QueueError::Deserialization("missing task field".to_string()))?;
    let task = Task::from_json(raw)?;

    if let Some(job_id) = entry.fields.get("job_id") {
        if job_id != &task.job_id.to_string() {
            return Err(QueueError::Deserialization(format!(
                "job_id field {job_id} does not match task {}",
                task.job_id
            )));
        }
    }
    Ok(task)
}

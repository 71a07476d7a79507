//! Redis Streams-backed work queue (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream key**: `media_graph:jobs`, one entry per enqueued job
//! - **Consumer group**: `media_graph_workers`; each worker is a named consumer
//! - **Dead-letter stream**: `media_graph:jobs:dlq`
//!
//! ## Delivery
//!
//! A read entry sits in the group's pending list until `XACK`. Entries idle
//! longer than the visibility timeout are taken over by the next consumer that
//! dequeues (`XAUTOCLAIM`), which is how a crashed worker's job gets redelivered.
//! `extend` resets the idle time (`XCLAIM .. JUSTID`) so a live worker keeps its
//! entry; a consumer that no longer owns the entry gets `UnknownHandle`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use mediagraph_core::JobDescriptor;

use super::{AckHandle, Delivery, QueueError, WorkQueue};

pub const DEFAULT_STREAM_KEY: &str = "media_graph:jobs";
pub const DEFAULT_DLQ_KEY: &str = "media_graph:jobs:dlq";
pub const DEFAULT_GROUP: &str = "media_graph_workers";
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Carries the delivery count across a requeue, which mints a new entry.
const PRIOR_DELIVERIES_FIELD: &str = "prior_deliveries";

#[derive(Debug, Clone)]
pub struct RedisStreamsWorkQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
    group_ready: Arc<AtomicBool>,
}

/// One stream entry as read back from Redis.
#[derive(Debug, Clone, PartialEq)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, String>,
}

impl StreamEntry {
    fn descriptor(&self) -> Result<JobDescriptor, QueueError> {
        let payload = self
            .fields
            .get("payload")
            .ok_or_else(|| QueueError::Serialization(format!("entry {} has no payload", self.id)))?;
        serde_json::from_str(payload).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    fn prior_deliveries(&self) -> u32 {
        self.fields
            .get(PRIOR_DELIVERIES_FIELD)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

fn classify(context: &str, e: redis::RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        QueueError::Unavailable(format!("{context}: {e}"))
    } else {
        QueueError::Backend(format!("{context}: {e}"))
    }
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse `[id, [field, value, ...]]`. Deleted entries come back as nil.
fn parse_entry(value: &Value) -> Option<StreamEntry> {
    let Value::Bulk(parts) = value else {
        return None;
    };
    let id = value_string(parts.first()?)?;
    let Value::Bulk(raw_fields) = parts.get(1)? else {
        return None;
    };

    let fields = raw_fields
        .chunks(2)
        .filter_map(|pair| match pair {
            [k, v] => Some((value_string(k)?, value_string(v)?)),
            _ => None,
        })
        .collect();

    Some(StreamEntry { id, fields })
}

/// `XAUTOCLAIM` reply: `[next_cursor, [entry...], (deleted ids)]`.
/// `pending` is an extended XPENDING reply: (id, consumer, idle ms, deliveries).
fn owns(pending: &[(String, String, u64, u64)], id: &str, consumer: &str) -> bool {
    pending.iter().any(|(entry, owner, _, _)| entry == id && owner == consumer)
}

fn parse_autoclaim(reply: &Value) -> Vec<StreamEntry> {
    match reply {
        Value::Bulk(parts) => match parts.get(1) {
            Some(Value::Bulk(entries)) => entries.iter().filter_map(parse_entry).collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// `XRANGE` reply: `[entry...]`.
fn parse_range(reply: &Value) -> Vec<StreamEntry> {
    match reply {
        Value::Bulk(entries) => entries.iter().filter_map(parse_entry).collect(),
        _ => Vec::new(),
    }
}

/// `XREADGROUP` reply: nil on timeout, else `[[stream, [entry...]]...]`.
fn parse_read_group(reply: &Value) -> Vec<StreamEntry> {
    let Value::Bulk(streams) = reply else {
        return Vec::new();
    };
    streams
        .iter()
        .filter_map(|stream| match stream {
            Value::Bulk(pair) => pair.get(1),
            _ => None,
        })
        .flat_map(parse_range)
        .collect()
}

impl RedisStreamsWorkQueue {
    /// Create a queue client for `redis_url`, consuming as `consumer`.
    pub fn new(redis_url: impl AsRef<str>, consumer: Option<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Backend(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            dlq_key: DEFAULT_DLQ_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.unwrap_or_else(|| format!("worker-{}", Uuid::now_v7())),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            group_ready: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_stream_key(mut self, stream_key: impl Into<String>) -> Self {
        self.stream_key = stream_key.into();
        self.dlq_key = format!("{}:dlq", self.stream_key);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client.get_connection().map_err(|e| classify("connect", e))
    }

    /// Ensure the consumer group exists (idempotent).
    pub fn ensure_group(&self) -> Result<(), QueueError> {
        if self.group_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut conn = self.connection()?;

        // "0" so a freshly created group also sees entries added before it existed.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(classify("XGROUP CREATE", e)),
        }
        self.group_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn visibility_ms(&self) -> u64 {
        u64::try_from(self.visibility_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn add_entry(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
        descriptor: &JobDescriptor,
        extra: &[(&str, String)],
    ) -> Result<String, QueueError> {
        let payload =
            serde_json::to_string(descriptor).map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key)
            .arg("*")
            .arg("job_id")
            .arg(descriptor.job_id.as_str())
            .arg("kind")
            .arg(descriptor.kind.as_str())
            .arg("payload")
            .arg(payload);
        for (field, value) in extra {
            cmd.arg(*field).arg(value);
        }
        cmd.query(conn).map_err(|e| classify("XADD", e))
    }

    /// Remove an entry from the pending list and the stream. Returns whether it was pending.
    fn settle(&self, conn: &mut redis::Connection, id: &str) -> Result<bool, QueueError> {
        let (acked, _deleted): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(id)
            .query(conn)
            .map_err(|e| classify("XACK", e))?;
        Ok(acked > 0)
    }

    fn read_entry(&self, conn: &mut redis::Connection, id: &str) -> Result<StreamEntry, QueueError> {
        let reply: Value = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg(id)
            .arg(id)
            .query(conn)
            .map_err(|e| classify("XRANGE", e))?;
        parse_range(&reply)
            .into_iter()
            .next()
            .ok_or_else(|| QueueError::UnknownHandle(id.to_string()))
    }

    fn pending_deliveries(&self, conn: &mut redis::Connection, id: &str) -> Result<u32, QueueError> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query(conn)
            .map_err(|e| classify("XPENDING", e))?;
        Ok(pending
            .first()
            .map(|(_, _, _, count)| u32::try_from(*count).unwrap_or(u32::MAX))
            .unwrap_or(1))
    }

    /// Whether this consumer still owns pending entry `id`.
    fn holds(&self, conn: &mut redis::Connection, id: &str) -> Result<bool, QueueError> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .arg(&self.consumer)
            .query(conn)
            .map_err(|e| classify("XPENDING", e))?;
        Ok(owns(&pending, id, &self.consumer))
    }

    /// Take over one entry whose previous consumer has gone quiet.
    fn claim_stale(&self, conn: &mut redis::Connection) -> Result<Option<StreamEntry>, QueueError> {
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_ms())
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query(conn)
            .map_err(|e| classify("XAUTOCLAIM", e))?;
        Ok(parse_autoclaim(&reply).into_iter().next())
    }

    fn read_new(&self, conn: &mut redis::Connection, wait: Duration) -> Result<Option<StreamEntry>, QueueError> {
        // BLOCK 0 waits forever.
        let block_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| classify("XREADGROUP", e))?;
        Ok(parse_read_group(&reply).into_iter().next())
    }

    fn to_delivery(&self, conn: &mut redis::Connection, entry: StreamEntry, redelivered: bool) -> Result<Option<Delivery>, QueueError> {
        let descriptor = match entry.descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                // Unreadable entries would come back forever; park them.
                warn!(entry_id = %entry.id, error = %e, "moving unreadable entry to dead-letter stream");
                let mut cmd = redis::cmd("XADD");
                cmd.arg(&self.dlq_key).arg("*").arg("original_entry_id").arg(&entry.id);
                for (field, value) in &entry.fields {
                    cmd.arg(field).arg(value);
                }
                let _: String = cmd.query(conn).map_err(|e| classify("DLQ XADD", e))?;
                self.settle(conn, &entry.id)?;
                return Ok(None);
            }
        };

        let this_entry = if redelivered {
            self.pending_deliveries(conn, &entry.id)?
        } else {
            1
        };

        Ok(Some(Delivery {
            descriptor,
            handle: AckHandle::new(entry.id.clone()),
            delivery_count: entry.prior_deliveries().saturating_add(this_entry),
        }))
    }
}

impl WorkQueue for RedisStreamsWorkQueue {
    #[instrument(skip(self, descriptor), fields(stream_key = %self.stream_key, job_id = %descriptor.job_id), err)]
    fn enqueue(&self, descriptor: &JobDescriptor) -> Result<String, QueueError> {
        self.ensure_group()?;
        let mut conn = self.connection()?;
        self.add_entry(&mut conn, &self.stream_key, descriptor, &[])
    }

    fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.ensure_group()?;
        let mut conn = self.connection()?;

        if let Some(entry) = self.claim_stale(&mut conn)? {
            debug!(entry_id = %entry.id, consumer = %self.consumer, "claimed stale entry");
            return self.to_delivery(&mut conn, entry, true);
        }

        match self.read_new(&mut conn, wait)? {
            Some(entry) => self.to_delivery(&mut conn, entry, false),
            None => Ok(None),
        }
    }

    fn ack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        if !self.settle(&mut conn, handle.as_str())? {
            return Err(QueueError::UnknownHandle(handle.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(stream_key = %self.stream_key), err)]
    fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let entry = self.read_entry(&mut conn, handle.as_str())?;
        let descriptor = entry.descriptor()?;
        let delivered = entry
            .prior_deliveries()
            .saturating_add(self.pending_deliveries(&mut conn, &entry.id)?);

        if requeue {
            self.add_entry(
                &mut conn,
                &self.stream_key,
                &descriptor,
                &[(PRIOR_DELIVERIES_FIELD, delivered.to_string())],
            )?;
        } else {
            self.add_entry(
                &mut conn,
                &self.dlq_key,
                &descriptor,
                &[
                    ("original_entry_id", entry.id.clone()),
                    ("deliveries", delivered.to_string()),
                    ("failed_at", chrono::Utc::now().to_rfc3339()),
                ],
            )?;
            warn!(job_id = %descriptor.job_id, deliveries = delivered, "job sent to dead-letter stream");
        }

        self.settle(&mut conn, &entry.id)?;
        Ok(())
    }

    fn extend(&self, handle: &AckHandle) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        // XCLAIM would take the entry back from whoever autoclaimed it.
        if !self.holds(&mut conn, handle.as_str())? {
            return Err(QueueError::UnknownHandle(handle.to_string()));
        }

        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(handle.as_str())
            .arg("JUSTID")
            .query(&mut conn)
            .map_err(|e| classify("XCLAIM", e))?;

        if claimed.is_empty() {
            return Err(QueueError::UnknownHandle(handle.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry_value(id: &str, fields: &[(&str, &str)]) -> Value {
        Value::Bulk(vec![
            data(id),
            Value::Bulk(fields.iter().flat_map(|(k, v)| [data(k), data(v)]).collect()),
        ])
    }

    #[test]
    fn parses_xreadgroup_reply() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data(DEFAULT_STREAM_KEY),
            Value::Bulk(vec![entry_value("1-0", &[("job_id", "a"), ("payload", "{}")])]),
        ])]);

        let entries = parse_read_group(&reply);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(entries[0].fields["job_id"], "a");
    }

    #[test]
    fn parses_xrange_reply() {
        let reply = Value::Bulk(vec![entry_value("7-1", &[("payload", "{}"), (PRIOR_DELIVERIES_FIELD, "3")])]);

        let entries = parse_range(&reply);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "7-1");
        assert_eq!(entries[0].prior_deliveries(), 3);
    }

    #[test]
    fn blocking_timeout_reads_nothing() {
        assert!(parse_read_group(&Value::Nil).is_empty());
    }

    #[test]
    fn autoclaim_skips_deleted_entries() {
        let reply = Value::Bulk(vec![
            data("0-0"),
            Value::Bulk(vec![Value::Nil, entry_value("2-0", &[("payload", "{}")])]),
            Value::Bulk(vec![]),
        ]);

        let entries = parse_autoclaim(&reply);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "2-0");
    }

    #[test]
    fn entry_without_payload_is_a_serialization_error() {
        let entry = parse_entry(&entry_value("3-0", &[("job_id", "a")])).unwrap();
        assert!(matches!(entry.descriptor(), Err(QueueError::Serialization(_))));
    }

    #[test]
    fn ownership_requires_matching_consumer() {
        let pending = vec![("5-0".to_string(), "worker-b".to_string(), 10, 2)];
        assert!(owns(&pending, "5-0", "worker-b"));
        assert!(!owns(&pending, "5-0", "worker-a"));
        assert!(!owns(&pending, "6-0", "worker-b"));
        assert!(!owns(&[], "5-0", "worker-b"));
    }

    #[test]
    fn stream_key_moves_dead_letter_key() {
        let queue = RedisStreamsWorkQueue::new("redis://localhost:6379/0", Some("w-1".to_string()))
            .unwrap()
            .with_stream_key("test:jobs");
        assert_eq!(queue.dlq_key, "test:jobs:dlq");
        assert_eq!(queue.consumer_name(), "w-1");
    }
}

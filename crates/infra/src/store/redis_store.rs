//! Redis-backed result store.
//!
//! - **Key**: `media_graph_task:<job_id>`, value is the JSON record
//! - **Expiry**: every write is a `SET .. PX <ttl>`, so the TTL is re-armed
//! - **Atomic update**: `WATCH` / `MULTI` / `EXEC`, retried when a concurrent
//!   writer touches the key between read and commit

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use mediagraph_core::{JobId, JobRecord};

use super::{Mutator, ResultStore, StoreError, UpdateOutcome};

/// Default key prefix for job records.
pub const DEFAULT_KEY_PREFIX: &str = "media_graph_task";

#[derive(Debug, Clone)]
pub struct RedisResultStore {
    client: Arc<redis::Client>,
    key_prefix: String,
}

/// What one optimistic update attempt decided.
enum Step {
    Missing,
    Corrupt(String),
    Unchanged(JobRecord),
    Updated(JobRecord),
}

fn classify(context: &str, e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        StoreError::Unavailable(format!("{context}: {e}"))
    } else {
        StoreError::Backend(format!("{context}: {e}"))
    }
}

/// Millisecond TTL for `PX`; Redis rejects zero.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl RedisResultStore {
    /// Create a store for `redis_url` (e.g. `redis://localhost:6379/0`).
    ///
    /// Opening the client does not connect; connection errors surface on first use.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Backend(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    fn key(&self, job_id: &JobId) -> String {
        format!("{}:{}", self.key_prefix, job_id)
    }

    fn connection(&self) -> Result<redis::Connection, StoreError> {
        self.client
            .get_connection()
            .map_err(|e| classify("connect", e))
    }
}

impl ResultStore for RedisResultStore {
    #[instrument(skip(self, record), fields(job_id = %record.job_id, state = %record.state), err)]
    fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;

        let _: () = redis::cmd("SET")
            .arg(self.key(&record.job_id))
            .arg(payload)
            .arg("PX")
            .arg(ttl_millis(record.ttl))
            .query(&mut conn)
            .map_err(|e| classify("SET", e))?;

        Ok(())
    }

    fn get(&self, job_id: &JobId) -> Result<JobRecord, StoreError> {
        let mut conn = self.connection()?;

        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(job_id))
            .query(&mut conn)
            .map_err(|e| classify("GET", e))?;

        let raw = raw.ok_or_else(|| StoreError::NotFound(job_id.clone()))?;
        serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    #[instrument(skip(self, mutator), fields(job_id = %job_id), err)]
    fn update(&self, job_id: &JobId, mutator: &mut Mutator<'_>) -> Result<UpdateOutcome, StoreError> {
        let key = self.key(job_id);
        let mut conn = self.connection()?;
        let mut attempts = 0u32;

        let step = redis::transaction(&mut conn, &[key.as_str()], |con, pipe| {
            attempts += 1;
            let raw: Option<String> = redis::cmd("GET").arg(&key).query(con)?;
            let Some(raw) = raw else {
                return Ok(Some(Step::Missing));
            };
            let current: JobRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(e) => return Ok(Some(Step::Corrupt(e.to_string()))),
            };

            let Some(next) = mutator(&current) else {
                return Ok(Some(Step::Unchanged(current)));
            };
            let payload = match serde_json::to_string(&next) {
                Ok(payload) => payload,
                Err(e) => return Ok(Some(Step::Corrupt(e.to_string()))),
            };

            // EXEC replies nil when a watched key changed; the helper then retries.
            let committed: Option<()> = pipe
                .cmd("SET")
                .arg(&key)
                .arg(payload)
                .arg("PX")
                .arg(ttl_millis(next.ttl))
                .ignore()
                .query(con)?;
            Ok(committed.map(|_| Step::Updated(next)))
        })
        .map_err(|e| classify("update transaction", e))?;

        if attempts > 1 {
            debug!(attempts, "update retried after concurrent write");
        }

        match step {
            Step::Missing => Err(StoreError::NotFound(job_id.clone())),
            Step::Corrupt(e) => Err(StoreError::Serialization(e)),
            Step::Unchanged(record) => Ok(UpdateOutcome::Unchanged(record)),
            Step::Updated(record) => Ok(UpdateOutcome::Updated(record)),
        }
    }

    fn delete(&self, job_id: &JobId) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(job_id))
            .query(&mut conn)
            .map_err(|e| classify("DEL", e))?;
        Ok(())
    }

    fn expire_after(&self, job_id: &JobId, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(self.key(job_id))
            .arg(ttl_millis(ttl))
            .query(&mut conn)
            .map_err(|e| classify("PEXPIRE", e))?;

        if applied == 0 {
            return Err(StoreError::NotFound(job_id.clone()));
        }
        Ok(())
    }
}

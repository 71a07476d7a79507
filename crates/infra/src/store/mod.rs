//! Result store: durable key-value storage of job records.
//!
//! The store is the single source of truth for job status. Every state
//! transition is linearised through [`ResultStore::update`], an atomic
//! read-modify-write on one key; nothing holds a lock across calls.
//!
//! ## Semantics
//!
//! - Read-after-write: a `get` following a `put`/`update` from the same process
//!   observes the write (no client-side caching).
//! - Absence is [`StoreError::NotFound`], distinct from a PENDING record. Expired
//!   and never-created ids look the same.
//! - Every write re-arms the key's expiry to the record's `ttl`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use mediagraph_core::{JobId, JobRecord};

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use in_memory::InMemoryResultStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisResultStore;

/// Result store operation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The backend could not be reached; retrying may succeed.
    #[error("result store unavailable: {0}")]
    Unavailable(String),

    #[error("record serialization error: {0}")]
    Serialization(String),

    #[error("result store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Outcome of an atomic update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The mutator produced a new record and it was written.
    Updated(JobRecord),
    /// The mutator declined; this is the record as it was read.
    Unchanged(JobRecord),
}

impl UpdateOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            UpdateOutcome::Updated(r) | UpdateOutcome::Unchanged(r) => r,
        }
    }

    pub fn into_record(self) -> JobRecord {
        match self {
            UpdateOutcome::Updated(r) | UpdateOutcome::Unchanged(r) => r,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}

/// Mutator passed to [`ResultStore::update`].
///
/// Receives the current record and returns `Some(next)` to write it, or `None`
/// to leave the record untouched. May be invoked more than once when a backend
/// retries after a conflicting concurrent write; only the last invocation's
/// result is committed.
pub type Mutator<'a> = dyn FnMut(&JobRecord) -> Option<JobRecord> + 'a;

/// Keyed storage of job records with TTL-based expiry.
pub trait ResultStore: Send + Sync {
    /// Insert or overwrite a record.
    fn put(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Read the current record.
    fn get(&self, job_id: &JobId) -> Result<JobRecord, StoreError>;

    /// Atomic read-modify-write of one record.
    fn update(&self, job_id: &JobId, mutator: &mut Mutator<'_>) -> Result<UpdateOutcome, StoreError>;

    /// Remove a record. Removing an absent record is not an error.
    fn delete(&self, job_id: &JobId) -> Result<(), StoreError>;

    /// Make the record expire `ttl` from now.
    fn expire_after(&self, job_id: &JobId, ttl: Duration) -> Result<(), StoreError>;
}

impl<S> ResultStore for Arc<S>
where
    S: ResultStore + ?Sized,
{
    fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        (**self).put(record)
    }

    fn get(&self, job_id: &JobId) -> Result<JobRecord, StoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job_id: &JobId, mutator: &mut Mutator<'_>) -> Result<UpdateOutcome, StoreError> {
        (**self).update(job_id, mutator)
    }

    fn delete(&self, job_id: &JobId) -> Result<(), StoreError> {
        (**self).delete(job_id)
    }

    fn expire_after(&self, job_id: &JobId, ttl: Duration) -> Result<(), StoreError> {
        (**self).expire_after(job_id, ttl)
    }
}
